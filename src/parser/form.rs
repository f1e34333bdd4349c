use std::fmt;

use crate::ext::ByteSlice;


/// An ordered multimap of decoded form fields.
///
/// Every occurrence of a key is kept in arrival order. `Form::get` returns
/// the first value for a key, `Form::get_all` returns all of them.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct Form {
    entries: Vec<(String, String)>,
}

impl Form {
    /// Creates an empty [`Form`].
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field, keeping existing fields with the same key.
    #[inline]
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Returns the first value stored for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Returns all values stored for `key`, in arrival order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries.iter().filter(move |(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Tests whether at least one value is stored for `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Returns an iterator over all fields in arrival order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&str, &str)> + '_ {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the number of fields, counting repeated keys.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes all fields while keeping the allocation.
    #[inline]
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Debug for Form {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Form {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let entries = iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        Self { entries }
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for Form {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.entries.extend(iter.into_iter().map(|(k, v)| (k.into(), v.into())));
    }
}


/// Decodes `%XX` escapes in `input`, and `+` as a space if `plus_as_space`.
///
/// Escapes that are truncated or contain non-hex digits are kept literally.
#[must_use]
pub fn percent_decode(input: &[u8], plus_as_space: bool) -> Vec<u8> {
    if plus_as_space && input.contains(&b'+') {
        let spaced: Vec<u8> = input.iter().map(|&b| if b == b'+' { b' ' } else { b }).collect();
        percent_encoding::percent_decode(&spaced).collect()
    } else {
        percent_encoding::percent_decode(input).collect()
    }
}

#[inline]
fn decode_lossy(input: &[u8]) -> String {
    match String::from_utf8(percent_decode(input, true)) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

/// Parses an `application/x-www-form-urlencoded` string into `form`.
///
/// Tokens are separated by `&` or `;` and split at their first `=`. Both
/// halves are percent-decoded. Empty tokens are dropped, while tokens without
/// `=` are kept with an empty value. Returns the number of fields added.
pub fn parse_urlencoded(input: &[u8], form: &mut Form) -> usize {
    let before = form.len();
    for token in input.split(|&b| b == b'&' || b == b';') {
        if token.is_empty() {
            continue;
        }
        let (key, value) = token.split_once_byte(b'=').unwrap_or((token, b""));
        form.insert(decode_lossy(key), decode_lossy(value));
    }
    form.len() - before
}

/// Parses the value of a `Cookie` header into `form`.
///
/// Cookies are separated by `;` and split at their first `=`, with
/// surrounding whitespace trimmed. Names and values are not percent-decoded.
/// Returns the number of cookies added.
pub fn parse_cookies(input: &[u8], form: &mut Form) -> usize {
    let before = form.len();
    for token in input.split(|&b| b == b';').map(ByteSlice::trim_ws) {
        if token.is_empty() {
            continue;
        }
        let (name, value) = token.split_once_byte(b'=').unwrap_or((token, b""));
        form.insert(
            String::from_utf8_lossy(name.trim_ws()),
            String::from_utf8_lossy(value.trim_ws()),
        );
    }
    form.len() - before
}
