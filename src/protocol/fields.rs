use std::fmt;

use super::Error as ProtocolError;


/// A supported FastCGI protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::FromRepr)]
#[repr(u8)]
pub enum Version {
    /// FastCGI 1.0, the only version ever published.
    V1 = 1,
}

impl TryFrom<u8> for Version {
    type Error = ProtocolError;

    #[inline]
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Self::from_repr(v).ok_or(ProtocolError::UnknownVersion(v))
    }
}

impl From<Version> for u8 {
    #[inline]
    fn from(v: Version) -> Self {
        v as Self
    }
}


/// The function the web server expects the application to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::FromRepr)]
#[cfg_attr(test, derive(strum::EnumIter))]
#[repr(u16)]
pub enum Role {
    /// Receives the request environment and body, produces a response.
    Responder = 1,
    /// Receives the request environment only and decides whether the request
    /// is authorized.
    Authorizer = 2,
    /// Like a responder, but additionally receives a file on the Data stream.
    Filter = 3,
}

impl TryFrom<u16> for Role {
    type Error = ProtocolError;

    #[inline]
    fn try_from(v: u16) -> Result<Self, Self::Error> {
        Self::from_repr(v).ok_or(ProtocolError::UnknownRole(v))
    }
}

impl From<Role> for u16 {
    #[inline]
    fn from(v: Role) -> Self {
        v as Self
    }
}

impl Role {
    /// Tests whether this crate can serve requests in this role.
    ///
    /// Filter requests need the Data stream, which is not exposed to
    /// applications. They are answered with `ProtocolStatus::UnknownRole`.
    #[inline]
    #[must_use]
    pub fn is_supported(self) -> bool {
        matches!(self, Self::Responder | Self::Authorizer)
    }

    /// Tests whether the web server sends a Stdin stream for this role.
    #[inline]
    #[must_use]
    pub fn has_stdin(self) -> bool {
        !matches!(self, Self::Authorizer)
    }
}


bitflags::bitflags! {
    /// Control flags of a BeginRequest record.
    #[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RequestFlags: u8 {
        /// The application must not close the connection after the request.
        const KeepConn = 1;
    }
}

impl TryFrom<u8> for RequestFlags {
    type Error = ProtocolError;

    /// Parses a flags byte, rejecting reserved bits.
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Self::from_bits(v).ok_or(ProtocolError::UnknownFlags(v & !Self::all().bits()))
    }
}

impl From<RequestFlags> for u8 {
    #[inline]
    fn from(v: RequestFlags) -> Self {
        v.bits()
    }
}

impl fmt::Debug for RequestFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RequestFlags({:#03b})", self.bits())
    }
}


/// The protocol-level outcome reported in an EndRequest record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::FromRepr)]
#[cfg_attr(test, derive(strum::EnumIter))]
#[repr(u8)]
pub enum ProtocolStatus {
    /// The request ran to completion.
    RequestComplete = 0,
    /// The request was rejected because the connection is already busy and
    /// the application does not multiplex.
    CantMpxConn = 1,
    /// The request was rejected because the application is out of capacity.
    Overloaded = 2,
    /// The request was rejected because its role is not implemented.
    UnknownRole = 3,
}

impl TryFrom<u8> for ProtocolStatus {
    type Error = ProtocolError;

    #[inline]
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Self::from_repr(v).ok_or(ProtocolError::UnknownStatus(v))
    }
}

impl From<ProtocolStatus> for u8 {
    #[inline]
    fn from(v: ProtocolStatus) -> Self {
        v as Self
    }
}


/// The type of a FastCGI record.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::FromRepr)]
#[cfg_attr(test, derive(strum::EnumIter))]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl TryFrom<u8> for RecordType {
    type Error = ProtocolError;

    #[inline]
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Self::from_repr(v).ok_or(ProtocolError::UnknownRecordType(v))
    }
}

impl From<RecordType> for u8 {
    #[inline]
    fn from(v: RecordType) -> Self {
        v as Self
    }
}

impl RecordType {
    /// Tests whether records of this type are only valid with the null request ID.
    #[inline]
    #[must_use]
    pub fn is_management(self) -> bool {
        matches!(self, Self::GetValues | Self::GetValuesResult | Self::UnknownType)
    }

    /// Tests whether records of this type carry stream data.
    #[inline]
    #[must_use]
    pub fn is_stream(self) -> bool {
        matches!(self, Self::Params | Self::Stdin | Self::Stdout | Self::Stderr | Self::Data)
    }

    /// Tests whether this stream flows from the web server to the application.
    #[inline]
    #[must_use]
    pub fn is_input_stream(self) -> bool {
        matches!(self, Self::Params | Self::Stdin | Self::Data)
    }
}


#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;
    use super::*;

    #[test]
    fn codes_roundtrip() {
        for rtype in RecordType::iter() {
            assert_eq!(RecordType::try_from(u8::from(rtype)), Ok(rtype));
        }
        for role in Role::iter() {
            assert_eq!(Role::try_from(u16::from(role)), Ok(role));
        }
        for status in ProtocolStatus::iter() {
            assert_eq!(ProtocolStatus::try_from(u8::from(status)), Ok(status));
        }
    }

    #[test]
    fn wire_codes() {
        assert_eq!(u8::from(RecordType::BeginRequest), 1);
        assert_eq!(u8::from(RecordType::UnknownType), 11);
        assert_eq!(u16::from(Role::Filter), 3);
        assert_eq!(u8::from(ProtocolStatus::UnknownRole), 3);
        assert_eq!(Role::try_from(0), Err(ProtocolError::UnknownRole(0)));
        assert_eq!(ProtocolStatus::try_from(4), Err(ProtocolError::UnknownStatus(4)));
    }

    #[test]
    fn flags() {
        assert_eq!(RequestFlags::try_from(1), Ok(RequestFlags::KeepConn));
        assert_eq!(RequestFlags::try_from(0), Ok(RequestFlags::empty()));
        assert_eq!(RequestFlags::try_from(0x83), Err(ProtocolError::UnknownFlags(0x82)));
        assert_eq!(format!("{:?}", RequestFlags::KeepConn), "RequestFlags(0b1)");
    }

    #[test]
    fn stream_kinds() {
        let input: Vec<_> = RecordType::iter().filter(|r| r.is_input_stream()).collect();
        assert_eq!(input, [RecordType::Params, RecordType::Stdin, RecordType::Data]);
        assert!(RecordType::iter().filter(|r| r.is_input_stream()).all(RecordType::is_stream));
        assert!(!Role::Authorizer.has_stdin());
        assert!(!Role::Filter.is_supported());
    }
}
