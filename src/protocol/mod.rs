/// Fixed-size bodies of the BeginRequest, EndRequest and UnknownType records.
pub mod body;
mod fields;
/// An encoder and decoder for FastCGI name-value pairs.
pub mod nv;
/// FastCGI's 1-or-4 byte length prefixes.
pub mod varint;
mod vars;

pub use fields::*;
pub use vars::*;


/// The request ID reserved for management records.
pub const FCGI_NULL_REQUEST_ID: u16 = 0;

/// The file descriptor of the listening socket handed to a FastCGI
/// application that was spawned by its web server.
#[cfg(any(target_family = "unix", doc))]
pub const FCGI_LISTENSOCK_FILENO: std::os::fd::RawFd = 0;

/// The largest payload a single record can carry.
pub const MAX_CONTENT_LEN: u16 = u16::MAX;


/// Errors raised while decoding or encoding FastCGI protocol elements.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The version byte of a record header is not a supported version.
    #[error("unknown FastCGI protocol version {0}")]
    UnknownVersion(u8),
    /// The type byte of a record header does not name a known record type.
    #[error("unknown FastCGI record type {0}")]
    UnknownRecordType(u8),
    /// The role of a BeginRequest body is not a known role.
    #[error("unknown FastCGI role {0}")]
    UnknownRole(u16),
    /// The flags byte of a BeginRequest body has reserved bits set.
    #[error("unknown FastCGI request flags {0:#010b}")]
    UnknownFlags(u8),
    /// The protocol status of an EndRequest body is not a known status.
    #[error("unknown FastCGI protocol status {0}")]
    UnknownStatus(u8),
    /// A GetValues name is not one of the management variables.
    #[error("unknown FastCGI management variable")]
    UnknownVariable,

    /// A length does not fit into 31 bits.
    #[error("length is too large to be encoded as a FastCGI VarInt")]
    InvalidVarInt,
}


/// Splits a [`u16`] into its two wire bytes, most significant first.
#[inline]
#[must_use]
pub(crate) const fn split_u16(v: u16) -> [u8; 2] {
    [((v >> 8) & 0xff) as u8, (v & 0xff) as u8]
}

/// Joins two wire bytes, most significant first, into a [`u16`].
#[inline]
#[must_use]
pub(crate) const fn join_u16(hi: u8, lo: u8) -> u16 {
    ((hi as u16) << 8) | lo as u16
}

/// Splits a [`u32`] into its four wire bytes, most significant first.
#[inline]
#[must_use]
pub(crate) const fn split_u32(v: u32) -> [u8; 4] {
    [
        ((v >> 24) & 0xff) as u8,
        ((v >> 16) & 0xff) as u8,
        ((v >> 8) & 0xff) as u8,
        (v & 0xff) as u8,
    ]
}

/// Joins four wire bytes, most significant first, into a [`u32`].
#[inline]
#[must_use]
pub(crate) const fn join_u32(b: [u8; 4]) -> u32 {
    ((b[0] as u32) << 24) | ((b[1] as u32) << 16) | ((b[2] as u32) << 8) | b[3] as u32
}


/// The 8-byte header preceding every FastCGI record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordHeader {
    /// The protocol version of the record.
    pub version: Version,
    /// The record type, which determines how the body is interpreted.
    pub rtype: RecordType,
    /// The request this record belongs to, or 0 for management records.
    pub request_id: u16,
    /// The number of body bytes.
    pub content_length: u16,
    /// The number of padding bytes following the body.
    pub padding_length: u8,
}

impl RecordHeader {
    /// The number of bytes in an encoded [`RecordHeader`].
    pub const LEN: usize = 8;

    /// Creates a [`Version::V1`] header without a body.
    #[inline]
    #[must_use]
    pub fn new(rtype: RecordType, request_id: u16) -> Self {
        Self { version: Version::V1, rtype, request_id, content_length: 0, padding_length: 0 }
    }

    /// Sets `content_length` and pads the record body to a multiple of 8 bytes.
    ///
    /// The sum of body and padding must stay representable in a [`u16`], so
    /// `content_length` is clamped to `u16::MAX - 7` before padding. The
    /// clamped length is returned.
    #[inline]
    pub fn set_lengths(&mut self, content_length: usize) -> u16 {
        const CLAMP: usize = (MAX_CONTENT_LEN as usize) & !7;
        let content = if content_length > usize::from(MAX_CONTENT_LEN) - 7 {
            CLAMP
        } else {
            content_length
        };
        #[allow(clippy::cast_possible_truncation)]
        let content = content as u16;
        self.content_length = content;
        self.padding_length = ((8 - content % 8) % 8) as u8;
        content
    }

    /// Tests whether this header introduces a management record.
    #[inline]
    #[must_use]
    pub fn is_management(self) -> bool {
        self.request_id == FCGI_NULL_REQUEST_ID
    }

    /// Returns the total number of bytes following the header.
    #[inline]
    #[must_use]
    pub fn body_len(self) -> usize {
        usize::from(self.content_length) + usize::from(self.padding_length)
    }

    /// Returns `self.padding_length` zero bytes.
    #[inline]
    #[must_use]
    pub fn padding_bytes(self) -> &'static [u8] {
        static PADDING: [u8; u8::MAX as usize] = [0; u8::MAX as usize];
        &PADDING[..self.padding_length.into()]
    }

    /// Decodes a record header from its wire format.
    ///
    /// # Errors
    /// Fails on an unsupported version or an unknown record type. In the
    /// latter case the remaining fields can still be read from `data`.
    pub fn from_bytes(data: [u8; Self::LEN]) -> Result<Self, Error> {
        Ok(Self {
            version: Version::try_from(data[0])?,
            rtype: RecordType::try_from(data[1])?,
            request_id: join_u16(data[2], data[3]),
            content_length: join_u16(data[4], data[5]),
            padding_length: data[6],
        })
    }

    /// Encodes the record header into its wire format. The reserved byte is zero.
    #[inline]
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let [id_hi, id_lo] = split_u16(self.request_id);
        let [len_hi, len_lo] = split_u16(self.content_length);
        [
            self.version.into(), self.rtype.into(),
            id_hi, id_lo, len_hi, len_lo,
            self.padding_length, 0,
        ]
    }
}


/// Decodes a record header. See `RecordHeader::from_bytes`.
///
/// # Errors
/// Fails on an unsupported version or an unknown record type.
#[inline]
pub fn decode_header(data: [u8; RecordHeader::LEN]) -> Result<RecordHeader, Error> {
    RecordHeader::from_bytes(data)
}

/// Encodes a record header. See `RecordHeader::to_bytes`.
#[inline]
#[must_use]
pub fn encode_header(head: RecordHeader) -> [u8; RecordHeader::LEN] {
    head.to_bytes()
}

/// Encodes a complete BeginRequest record for `request_id`.
#[inline]
#[must_use]
pub fn encode_begin_request(request_id: u16, body: body::BeginRequest) -> [u8; 16] {
    body.to_record(request_id)
}

/// Encodes a complete EndRequest record for `request_id`.
#[inline]
#[must_use]
pub fn encode_end_request(request_id: u16, body: body::EndRequest) -> [u8; 16] {
    body.to_record(request_id)
}

/// Encodes a complete UnknownType management record for the unknown `rtype`.
#[inline]
#[must_use]
pub fn encode_unknown_type(rtype: u8) -> [u8; 16] {
    body::UnknownType { rtype }.to_record(FCGI_NULL_REQUEST_ID)
}
