/// An extension trait for searching and splitting byte slices.
pub(crate) trait ByteSlice {
    /// Returns the index of the first occurrence of `needle`.
    ///
    /// An empty `needle` is found at index 0.
    fn find(&self, needle: &[u8]) -> Option<usize>;

    /// Splits the slice at the first occurrence of `sep`, excluding `sep`
    /// from both halves.
    fn split_once_byte(&self, sep: u8) -> Option<(&[u8], &[u8])>;

    /// Removes leading and trailing ASCII whitespace.
    fn trim_ws(&self) -> &[u8];
}

impl ByteSlice for [u8] {
    fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0);
        }
        self.windows(needle.len()).position(|w| w == needle)
    }

    #[inline]
    fn split_once_byte(&self, sep: u8) -> Option<(&[u8], &[u8])> {
        let idx = self.iter().position(|&b| b == sep)?;
        Some((&self[..idx], &self[(idx + 1)..]))
    }

    fn trim_ws(&self) -> &[u8] {
        let start = self.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(self.len());
        let end = self.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
        &self[start..end.max(start)]
    }
}
