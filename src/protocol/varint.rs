use std::fmt;
use std::io::{self, Write};

use super::Error as ProtocolError;
use super::{join_u32, split_u32};


/// A name or value length as prefixed to FastCGI name-value pairs.
///
/// Lengths up to 127 take a single byte. Longer lengths take 4 bytes with the
/// high bit of the first byte set, leaving 31 bits for the length itself.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VarInt(u32);

impl VarInt {
    const LONG_BIT: u8 = 0x80;
    /// The largest length that fits into the 1-byte encoding.
    pub const SHORT_MAX: u32 = 0x7f;
    /// The largest encodable length.
    pub const MAX: Self = VarInt(0x7fff_ffff);

    /// Returns the number of bytes an encoding starting with `first` occupies.
    #[inline]
    #[must_use]
    pub fn encoded_len(first: u8) -> usize {
        if first & Self::LONG_BIT == 0 { 1 } else { 4 }
    }

    /// Decodes a [`VarInt`] from the start of `data`.
    ///
    /// Returns the value and the number of bytes it occupied, or [`None`] if
    /// `data` ends before the encoding does.
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<(Self, usize)> {
        let first = *data.first()?;
        if Self::encoded_len(first) == 1 {
            return Some((Self(first.into()), 1));
        }
        let long: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Some((Self(join_u32([long[0] & !Self::LONG_BIT, long[1], long[2], long[3]])), 4))
    }

    /// Encodes the [`VarInt`] into the writer, returning the encoded length.
    ///
    /// # Errors
    /// Any errors from [`Write::write_all`] are forwarded to the caller.
    pub fn write(self, mut w: impl Write) -> io::Result<usize> {
        if self.0 <= Self::SHORT_MAX {
            #[allow(clippy::cast_possible_truncation)]
            w.write_all(&[self.0 as u8]).and(Ok(1))
        } else {
            let mut long = split_u32(self.0);
            long[0] |= Self::LONG_BIT;
            w.write_all(&long).and(Ok(4))
        }
    }

    /// Converts the length into a [`usize`], saturating on 16-bit targets.
    #[inline]
    #[must_use]
    pub fn to_usize(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl From<VarInt> for u32 {
    #[inline]
    fn from(v: VarInt) -> Self {
        v.0
    }
}

impl From<u8> for VarInt {
    #[inline]
    fn from(v: u8) -> Self {
        Self(v.into())
    }
}

impl From<u16> for VarInt {
    #[inline]
    fn from(v: u16) -> Self {
        Self(v.into())
    }
}

impl TryFrom<u32> for VarInt {
    type Error = ProtocolError;

    #[inline]
    fn try_from(v: u32) -> Result<Self, Self::Error> {
        if v > Self::MAX.0 {
            Err(ProtocolError::InvalidVarInt)
        } else {
            Ok(Self(v))
        }
    }
}

impl TryFrom<usize> for VarInt {
    type Error = ProtocolError;

    #[inline]
    fn try_from(v: usize) -> Result<Self, Self::Error> {
        u32::try_from(v).map_err(|_| ProtocolError::InvalidVarInt).and_then(Self::try_from)
    }
}

impl fmt::Display for VarInt {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
