use crate::protocol::nv;


/// A decoder for the name-value pairs of a PARAMS stream.
///
/// The web server may split a pair anywhere, including inside its length
/// prefix, both between records and between reads. Complete pairs are handed
/// to the caller as soon as they arrive, while a partial pair is carried over
/// to the next `ParamsDecoder::feed`.
#[derive(Debug, Default, Clone)]
pub struct ParamsDecoder {
    pending: Vec<u8>,
}

impl ParamsDecoder {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of bytes of an incomplete pair held by the decoder.
    #[inline]
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Decodes all pairs completed by `data`, passing them to `on_pair`.
    pub fn feed(&mut self, mut data: &[u8], mut on_pair: impl FnMut(&[u8], &[u8])) {
        if !self.pending.is_empty() {
            data = self.complete_pending(data, &mut on_pair);
            if !self.pending.is_empty() {
                return;
            }
        }

        let mut nvit = nv::NVIter::new(data);
        for (name, value) in &mut nvit {
            on_pair(name, value);
        }
        let rest = nvit.into_inner();
        if !rest.is_empty() {
            self.pending.extend_from_slice(rest);
            crate::macros::trace!(buffered = rest.len(), "name-value pair crossed chunk boundary");
        }
    }

    /// Moves bytes from `data` into the pending pair until it is complete,
    /// returning the unused remainder of `data`.
    fn complete_pending<'a>(
        &mut self,
        mut data: &'a [u8],
        on_pair: &mut impl FnMut(&[u8], &[u8]),
    ) -> &'a [u8] {
        // Both length prefixes take at most 8 bytes, so growing the prefix
        // byte by byte stays cheap.
        let (name_len, val_len, prefix) = loop {
            if let Some(lens) = nv::decode_lengths(&self.pending) {
                break lens;
            }
            let Some((&b, rest)) = data.split_first() else {
                return data;
            };
            self.pending.push(b);
            data = rest;
        };

        let total = prefix.saturating_add(name_len).saturating_add(val_len);
        let missing = total.saturating_sub(self.pending.len());
        let take = missing.min(data.len());
        self.pending.extend_from_slice(&data[..take]);
        data = &data[take..];

        if self.pending.len() == total {
            let (name, value) = self.pending[prefix..].split_at(name_len);
            on_pair(name, value);
            self.pending.clear();
        }
        data
    }

    /// Ends the stream, discarding an incomplete trailing pair.
    ///
    /// Returns the number of discarded bytes. The decoder can be reused for
    /// another stream afterwards.
    pub fn finish(&mut self) -> usize {
        let dropped = self.pending.len();
        if dropped > 0 {
            tracing::warn!(bytes = dropped, "PARAMS stream ends with incomplete name-value pair");
        }
        self.pending.clear();
        dropped
    }
}
