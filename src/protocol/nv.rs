use std::io::{self, Write};

use super::varint::VarInt;


/// Decodes the length prefix of a name-value pair at the start of `data`.
///
/// Returns the name length, the value length and the size of the prefix, or
/// [`None`] if the prefix is incomplete.
#[must_use]
pub fn decode_lengths(data: &[u8]) -> Option<(usize, usize, usize)> {
    let (name_len, a) = VarInt::decode(data)?;
    let (val_len, b) = VarInt::decode(&data[a..])?;
    Some((name_len.to_usize(), val_len.to_usize(), a + b))
}


/// An iterator over the complete name-value pairs at the start of its input.
///
/// Iteration stops at the first incomplete pair. The unparsed remainder is
/// available via `NVIter::into_inner`.
#[derive(Debug, Clone)]
pub struct NVIter<'a> {
    data: &'a [u8],
}

impl<'a> NVIter<'a> {
    #[inline]
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Returns the input bytes not consumed by the iterator.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> &'a [u8] {
        self.data
    }
}

impl<'a> Iterator for NVIter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let (name_len, val_len, prefix) = decode_lengths(self.data)?;
        let body = &self.data[prefix..];
        let total = name_len.checked_add(val_len)?;
        if body.len() < total {
            return None;
        }
        let (name, rest) = body.split_at(name_len);
        let (value, rest) = rest.split_at(val_len);
        self.data = rest;
        Some((name, value))
    }
}

impl std::iter::FusedIterator for NVIter<'_> {}


/// Encodes a name-value pair into the writer, returning the encoded length.
///
/// # Errors
/// Fails with [`io::ErrorKind::InvalidInput`] if either length exceeds 31
/// bits. Any errors from [`Write::write_all`] are forwarded to the caller.
pub fn write((name, value): (&[u8], &[u8]), mut w: impl Write) -> io::Result<usize> {
    let invalid = |e| io::Error::new(io::ErrorKind::InvalidInput, e);
    let name_len = VarInt::try_from(name.len()).map_err(invalid)?;
    let val_len = VarInt::try_from(value.len()).map_err(invalid)?;
    let prefix = name_len.write(&mut w)? + val_len.write(&mut w)?;
    w.write_all(name)?;
    w.write_all(value)?;
    Ok(prefix + name.len() + value.len())
}
