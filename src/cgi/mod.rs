use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use compact_str::CompactString;
use http::header::{self, HeaderName};

mod intern;

pub use intern::StaticVarName;
pub use StaticVarName::*;

/// Prefix of variables which carry an HTTP request header.
const HEADER_PREFIX: &str = "HTTP_";


/// A borrowed CGI/1.1 variable name.
///
/// Variable names are case-insensitive (RFC 3875, Section 4.1). Comparisons
/// and hashing ignore ASCII case, but the name keeps the spelling the web
/// server used.
#[derive(Debug, ref_cast::RefCastCustom)]
#[repr(transparent)]
pub struct VarName(str);

impl VarName {
    /// Views a string as a [`VarName`].
    ///
    /// `&str`, `&String`, [`OwnedVarName`] and [`StaticVarName`] all convert
    /// into `&VarName` with [`From`].
    #[ref_cast::ref_cast_custom]
    // ref-cast checks the transmute it generates
    #[allow(unsafe_code, clippy::let_underscore_untyped)]
    #[must_use]
    pub const fn new(s: &str) -> &Self;

    /// Returns the name in the spelling of the web server.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the HTTP request header passed in this variable.
    ///
    /// `HTTP_ACCEPT_LANGUAGE` maps to `accept-language`. `CONTENT_TYPE` and
    /// `CONTENT_LENGTH` carry headers without the prefix. All other variables
    /// describe the request and return [`None`].
    #[must_use]
    pub fn header_name(&self) -> Option<HeaderName> {
        if self == <&Self>::from(CONTENT_TYPE) {
            return Some(header::CONTENT_TYPE);
        }
        if self == <&Self>::from(CONTENT_LENGTH) {
            return Some(header::CONTENT_LENGTH);
        }
        let prefix = self.0.get(..HEADER_PREFIX.len())?;
        if !prefix.eq_ignore_ascii_case(HEADER_PREFIX) {
            return None;
        }
        let header: Vec<u8> = self.0.as_bytes()[HEADER_PREFIX.len()..]
            .iter()
            .map(|&b| if b == b'_' { b'-' } else { b.to_ascii_lowercase() })
            .collect();
        HeaderName::from_bytes(&header).ok()
    }
}

impl<'a, T: AsRef<str> + ?Sized> From<&'a T> for &'a VarName {
    #[inline]
    fn from(v: &'a T) -> Self {
        VarName::new(v.as_ref())
    }
}

impl From<StaticVarName> for &VarName {
    #[inline]
    fn from(v: StaticVarName) -> Self {
        VarName::new(v.into())
    }
}

impl fmt::Display for VarName {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq for VarName {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}
impl Eq for VarName {}

impl PartialOrd for VarName {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VarName {
    fn cmp(&self, other: &Self) -> Ordering {
        fn upper(s: &VarName) -> impl Iterator<Item = u8> + '_ {
            s.0.bytes().map(|b| b.to_ascii_uppercase())
        }
        upper(self).cmp(upper(other))
    }
}

impl Hash for VarName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.0.len());
        self.0.bytes().for_each(|b| state.write_u8(b.to_ascii_uppercase()));
    }
}


#[derive(Clone)]
enum Repr {
    Static(StaticVarName),
    Custom(CompactString),
}

/// An owned [`VarName`], the key type of a request's environment.
///
/// Well-known names are interned as a [`StaticVarName`] regardless of their
/// case and then use its canonical spelling. Other names are kept in a
/// [`CompactString`], which stores most header variables inline.
#[derive(Clone)]
#[repr(transparent)]
pub struct OwnedVarName(Repr);

impl OwnedVarName {
    /// Wraps an already allocated name, replacing it with its interned
    /// variant if there is one.
    #[must_use]
    pub fn from_compact(name: CompactString) -> Self {
        if let Ok(s) = name.parse() {
            return Self(Repr::Static(s));
        }
        if name.bytes().any(|b| b.is_ascii_lowercase()) {
            if let Ok(s) = name.to_ascii_uppercase().parse() {
                return Self(Repr::Static(s));
            }
        }
        Self(Repr::Custom(name))
    }

    /// Creates a name from raw PARAMS bytes.
    ///
    /// Invalid UTF-8 sequences are replaced with `U+FFFD`.
    #[must_use]
    pub fn from_utf8_lossy(name: &[u8]) -> Self {
        Self::from_compact(CompactString::from_utf8_lossy(name))
    }

    /// Returns the variable a web server stores an HTTP request header in.
    #[must_use]
    pub fn from_header(name: &HeaderName) -> Self {
        if *name == header::CONTENT_TYPE {
            return CONTENT_TYPE.into();
        }
        if *name == header::CONTENT_LENGTH {
            return CONTENT_LENGTH.into();
        }
        let mut var = CompactString::with_capacity(HEADER_PREFIX.len() + name.as_str().len());
        var.push_str(HEADER_PREFIX);
        var.extend(name.as_str().chars().map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() }));
        Self::from_compact(var)
    }

    /// Returns the interned variant of the name, if there is one.
    #[inline]
    #[must_use]
    pub fn as_static(&self) -> Option<StaticVarName> {
        match self.0 {
            Repr::Static(s) => Some(s),
            Repr::Custom(_) => None,
        }
    }

    /// Borrows the name as a [`VarName`].
    #[inline]
    #[must_use]
    pub fn as_var_name(&self) -> &VarName {
        self.borrow()
    }
}

impl From<StaticVarName> for OwnedVarName {
    #[inline]
    fn from(v: StaticVarName) -> Self {
        Self(Repr::Static(v))
    }
}

impl From<&str> for OwnedVarName {
    #[inline]
    fn from(v: &str) -> Self {
        Self::from_compact(v.into())
    }
}

impl From<&VarName> for OwnedVarName {
    #[inline]
    fn from(v: &VarName) -> Self {
        v.as_str().into()
    }
}

impl From<String> for OwnedVarName {
    #[inline]
    fn from(v: String) -> Self {
        Self::from_compact(v.into())
    }
}

impl AsRef<str> for OwnedVarName {
    #[inline]
    fn as_ref(&self) -> &str {
        match &self.0 {
            Repr::Static(s) => s.as_ref(),
            Repr::Custom(s) => s.as_str(),
        }
    }
}

impl Borrow<VarName> for OwnedVarName {
    #[inline]
    fn borrow(&self) -> &VarName {
        VarName::new(self.as_ref())
    }
}

impl ToOwned for VarName {
    type Owned = OwnedVarName;

    #[inline]
    fn to_owned(&self) -> Self::Owned {
        self.into()
    }
}

impl fmt::Debug for OwnedVarName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self.as_ref(), f)
    }
}

impl fmt::Display for OwnedVarName {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl PartialEq for OwnedVarName {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Repr::Static(a), Repr::Static(b)) => a == b,
            // Interning is case-insensitive, so only two customs can match
            (Repr::Custom(a), Repr::Custom(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }
}
impl Eq for OwnedVarName {}

impl PartialOrd for OwnedVarName {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OwnedVarName {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_var_name().cmp(other.as_var_name())
    }
}

impl Hash for OwnedVarName {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_var_name().hash(state);
    }
}
