use super::Error as ProtocolError;
use super::{join_u16, join_u32, split_u16, split_u32};
use super::{ProtocolStatus, RecordHeader, RecordType, RequestFlags, Role};


/// Prepends a record header to a fixed 8-byte body.
fn fixed_record(rtype: RecordType, request_id: u16, body: [u8; 8]) -> [u8; 16] {
    let mut head = RecordHeader::new(rtype, request_id);
    head.set_lengths(body.len());
    let mut rec = [0; 16];
    rec[..RecordHeader::LEN].copy_from_slice(&head.to_bytes());
    rec[RecordHeader::LEN..].copy_from_slice(&body);
    rec
}


/// The body of an UnknownType management record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownType {
    /// The record type byte the application did not understand.
    pub rtype: u8,
}

impl UnknownType {
    /// The number of bytes in an encoded [`UnknownType`] body.
    pub const LEN: usize = 8;

    #[inline]
    #[must_use]
    pub fn from_bytes(data: [u8; Self::LEN]) -> Self {
        Self { rtype: data[0] }
    }

    #[inline]
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        [self.rtype, 0, 0, 0, 0, 0, 0, 0]
    }

    /// Encodes the body together with its record header.
    #[inline]
    #[must_use]
    pub fn to_record(self, request_id: u16) -> [u8; 16] {
        fixed_record(RecordType::UnknownType, request_id, self.to_bytes())
    }
}


/// The body of a BeginRequest record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    /// The role the application takes for this request.
    pub role: Role,
    /// Control flags for this request.
    pub flags: RequestFlags,
}

impl BeginRequest {
    /// The number of bytes in an encoded [`BeginRequest`] body.
    pub const LEN: usize = 8;

    /// Decodes a BeginRequest body.
    ///
    /// Reserved flag bits are dropped rather than rejected, since a web server
    /// setting them still expects an answer for the request.
    ///
    /// # Errors
    /// Fails if the role is unknown.
    pub fn from_bytes(data: [u8; Self::LEN]) -> Result<Self, ProtocolError> {
        Ok(Self {
            role: Role::try_from(join_u16(data[0], data[1]))?,
            flags: RequestFlags::from_bits_truncate(data[2]),
        })
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let [role_hi, role_lo] = split_u16(self.role.into());
        [role_hi, role_lo, self.flags.into(), 0, 0, 0, 0, 0]
    }

    /// Encodes the body together with its record header.
    #[inline]
    #[must_use]
    pub fn to_record(self, request_id: u16) -> [u8; 16] {
        fixed_record(RecordType::BeginRequest, request_id, self.to_bytes())
    }
}


/// The body of an EndRequest record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    /// The application's exit status, as a CGI program would pass to exit(3).
    pub app_status: u32,
    /// The protocol-level outcome of the request.
    pub protocol_status: ProtocolStatus,
}

impl EndRequest {
    /// The number of bytes in an encoded [`EndRequest`] body.
    pub const LEN: usize = 8;

    /// Decodes an EndRequest body.
    ///
    /// # Errors
    /// Fails if the protocol status is unknown.
    pub fn from_bytes(data: [u8; Self::LEN]) -> Result<Self, ProtocolError> {
        Ok(Self {
            app_status: join_u32([data[0], data[1], data[2], data[3]]),
            protocol_status: ProtocolStatus::try_from(data[4])?,
        })
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let [a, b, c, d] = split_u32(self.app_status);
        [a, b, c, d, self.protocol_status.into(), 0, 0, 0]
    }

    /// Encodes the body together with its record header.
    #[inline]
    #[must_use]
    pub fn to_record(self, request_id: u16) -> [u8; 16] {
        fixed_record(RecordType::EndRequest, request_id, self.to_bytes())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_layout() -> Result<(), ProtocolError> {
        let body = BeginRequest { role: Role::Authorizer, flags: RequestFlags::KeepConn };
        assert_eq!(body.to_bytes(), [0, 2, 1, 0, 0, 0, 0, 0]);
        assert_eq!(BeginRequest::from_bytes(body.to_bytes())?, body);

        let rec = body.to_record(0x0102);
        assert_eq!(&rec[..8], &[1, 1, 1, 2, 0, 8, 0, 0]);
        Ok(())
    }

    #[test]
    fn begin_lenient_flags() -> Result<(), ProtocolError> {
        let body = BeginRequest::from_bytes([0, 1, 0xf1, 0, 0, 0, 0, 0])?;
        assert_eq!(body.role, Role::Responder);
        assert_eq!(body.flags, RequestFlags::KeepConn);
        assert!(matches!(
            BeginRequest::from_bytes([0x6e, 0xc4, 0, 0, 0, 0, 0, 0]),
            Err(ProtocolError::UnknownRole(0x6ec4)),
        ));
        Ok(())
    }

    #[test]
    fn end_layout() -> Result<(), ProtocolError> {
        let body = EndRequest { app_status: 0xdead_beef, protocol_status: ProtocolStatus::Overloaded };
        assert_eq!(body.to_bytes(), [0xde, 0xad, 0xbe, 0xef, 2, 0, 0, 0]);
        assert_eq!(EndRequest::from_bytes(body.to_bytes())?, body);
        assert_eq!(
            &body.to_record(7)[..],
            b"\x01\x03\x00\x07\x00\x08\x00\x00\xde\xad\xbe\xef\x02\x00\x00\x00",
        );
        Ok(())
    }

    #[test]
    fn unknown_layout() {
        let body = UnknownType { rtype: 0xa7 };
        assert_eq!(UnknownType::from_bytes(body.to_bytes()), body);
        assert_eq!(&body.to_record(0)[..], b"\x01\x0b\0\0\x00\x08\0\0\xa7\0\0\0\0\0\0\0");
    }
}
