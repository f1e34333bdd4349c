use std::io;

use compact_str::{CompactString, ToCompactString};

use super::Error as ProtocolError;
use super::{nv, RecordHeader, RecordType, FCGI_NULL_REQUEST_ID};
use crate::Config;


bitflags::bitflags! {
    /// A set of management variables a web server may query.
    ///
    /// Queries arrive as the names of a GetValues record. The application
    /// answers with a GetValuesResult record holding the subset of names it
    /// recognized together with their values.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProtocolVariables: u8 {
        /// The maximum number of concurrent connections the application accepts.
        const FCGI_MAX_CONNS = 0x01;
        /// The maximum number of concurrent requests the application accepts.
        const FCGI_MAX_REQS = 0x02;
        /// "1" if the application multiplexes requests over a connection, "0" otherwise.
        const FCGI_MPXS_CONNS = 0x04;
    }
}

impl ProtocolVariables {
    /// Parses a GetValues name into the matching management variable.
    ///
    /// # Errors
    /// Fails for names that are not management variables, including names
    /// that are not valid UTF-8.
    pub fn parse_name(name: &[u8]) -> Result<Self, ProtocolError> {
        std::str::from_utf8(name)
            .ok()
            .and_then(Self::from_name)
            .ok_or(ProtocolError::UnknownVariable)
    }

    /// Collects all known variables from the names of a GetValues body.
    ///
    /// Values sent by the web server are meaningless and ignored, as are
    /// unknown names.
    #[must_use]
    pub fn from_query(body: &[u8]) -> Self {
        nv::NVIter::new(body)
            .filter_map(|(name, _)| Self::parse_name(name).ok())
            .collect()
    }

    /// Appends a complete GetValuesResult record answering this query to `out`.
    ///
    /// Variables are answered from `config`. An empty query still yields an
    /// (empty) record, so the web server is not left waiting.
    ///
    /// # Errors
    /// Fails only if a value cannot be length-prefixed, which cannot happen
    /// for the values of [`Config`].
    pub fn write_response(self, out: &mut Vec<u8>, config: &Config) -> io::Result<usize> {
        let head_start = out.len();
        out.extend([0; RecordHeader::LEN]);

        for (name, var) in self.iter_names() {
            let value = if var == Self::FCGI_MAX_CONNS {
                config.max_conns.to_compact_string()
            } else if var == Self::FCGI_MAX_REQS {
                config.max_reqs.to_compact_string()
            } else {
                CompactString::const_new(if config.multiplex { "1" } else { "0" })
            };
            nv::write((name.as_bytes(), value.as_bytes()), &mut *out)?;
        }

        let mut head = RecordHeader::new(RecordType::GetValuesResult, FCGI_NULL_REQUEST_ID);
        let content = head.set_lengths(out.len() - head_start - RecordHeader::LEN);
        out[head_start..(head_start + RecordHeader::LEN)].copy_from_slice(&head.to_bytes());
        out.extend(head.padding_bytes());
        Ok(RecordHeader::LEN + usize::from(content) + usize::from(head.padding_length))
    }
}
