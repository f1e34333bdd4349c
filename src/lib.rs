#![deny(unsafe_code, single_use_lifetimes, unused_lifetimes)]
#![warn(missing_docs, keyword_idents, let_underscore_drop, unreachable_pub, unused_import_braces)]

#![deny(clippy::suspicious, clippy::cargo)]
#![deny(clippy::exit, clippy::semicolon_inside_block, clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::multiple_crate_versions)]
#![allow(clippy::enum_glob_use, clippy::items_after_statements, clippy::module_name_repetitions)]

//! An application-side FastCGI engine.
//!
//! The crate accepts connections from a web server, demultiplexes the
//! FastCGI records arriving on them into [`Request`]s and parses the request
//! environment, query string, cookies and POST bodies (including multipart
//! file uploads) on demand. Responses are written back as STDOUT records and
//! completed with an EndRequest record. Request objects are recycled through
//! a free list owned by the [`Acceptor`].

use std::num::{NonZeroU32, NonZeroUsize};
use std::path::PathBuf;

use smallvec::SmallVec;

mod macros;
/// Byte slice helpers shared by the parsers.
pub(crate) mod ext;

// Based on the FastCGI specification, especially Section 8.
// See: https://fastcgi-archives.github.io/FastCGI_Specification.html
pub mod protocol;

/// CGI/1.1 variable names.
pub mod cgi;

/// Sans-IO parsers for records, PARAMS streams and form bodies.
pub mod parser;

mod error;
pub use error::{Error, ErrorKind};

/// Byte stream transports and listeners.
pub mod transport;
pub use transport::{Listener, Transport};

mod connection;
pub use connection::{Client, Connection};

mod request;
pub use request::{Lifecycle, LoadTargets, Request, Steps, Upload};

mod response;
pub use response::{commit, Response};

mod acceptor;
pub use acceptor::{Acceptor, Handler};

/// An `async` driver for FastCGI connections.
#[cfg(feature = "async")]
pub mod async_io;

#[cfg(test)]
mod test_support;


const SMALLVEC_BASE_SIZE: usize = std::mem::size_of::<SmallVec<[u8; 0]>>();
// Maximum number of inline bytes before SmallVec exceeds SMALLVEC_BASE_SIZE.
// SmallVec spends one usize on its discriminant.
const INLINE_BYTES: usize = SMALLVEC_BASE_SIZE - std::mem::size_of::<usize>();
/// Byte storage for environment values, most of which fit inline.
pub(crate) type SmallBytes = SmallVec<[u8; INLINE_BYTES]>;


/// Runtime configuration shared by all connections of an application.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Config {
    /// Size of the read buffer of each connection.
    pub buffer_size: NonZeroUsize,
    /// Maximum number of concurrent connections, advertised as `FCGI_MAX_CONNS`.
    pub max_conns: NonZeroU32,
    /// Maximum number of concurrent requests per connection, advertised as
    /// `FCGI_MAX_REQS`. Further requests are rejected as overloaded.
    pub max_reqs: NonZeroU32,
    /// Whether requests may be multiplexed over one connection, advertised as
    /// `FCGI_MPXS_CONNS`. If disabled, a second request on a busy connection
    /// is rejected.
    pub multiplex: bool,
    /// Directory in which uploaded files are spooled.
    pub upload_dir: PathBuf,
    /// Keeps spooled uploads on disk after their request is cleared.
    pub keep_uploads: bool,
    /// Maximum size of a POST body in bytes.
    pub max_post: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        const DEFAULT_CONNS: NonZeroU32 = match NonZeroU32::new(64) {
            Some(v) => v,
            None => NonZeroU32::MIN,
        };
        const DEFAULT_BUFFER: NonZeroUsize = match NonZeroUsize::new(16 * 1024) {
            Some(v) => v,
            None => NonZeroUsize::MIN,
        };
        Self {
            buffer_size: DEFAULT_BUFFER,
            max_conns: DEFAULT_CONNS,
            max_reqs: DEFAULT_CONNS,
            multiplex: true,
            upload_dir: std::env::temp_dir(),
            keep_uploads: false,
            max_post: None,
        }
    }
}

impl Config {
    /// Creates a default [`Config`] accepting `max_conns` connections and as
    /// many requests per connection.
    #[must_use]
    pub fn with_conns(max_conns: NonZeroU32) -> Self {
        Self { max_conns, max_reqs: max_conns, ..Self::default() }
    }

    /// Sets the per-connection read buffer size.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: NonZeroUsize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Sets the per-connection request limit.
    #[must_use]
    pub fn with_max_reqs(mut self, max_reqs: NonZeroU32) -> Self {
        self.max_reqs = max_reqs;
        self
    }

    /// Enables or disables request multiplexing.
    #[must_use]
    pub fn with_multiplex(mut self, multiplex: bool) -> Self {
        self.multiplex = multiplex;
        self
    }

    /// Sets the directory for spooled uploads.
    #[must_use]
    pub fn with_upload_dir(mut self, upload_dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = upload_dir.into();
        self
    }

    /// Keeps spooled uploads after their request is cleared.
    #[must_use]
    pub fn with_keep_uploads(mut self, keep_uploads: bool) -> Self {
        self.keep_uploads = keep_uploads;
        self
    }

    /// Limits the size of POST bodies.
    #[must_use]
    pub fn with_max_post(mut self, max_post: Option<u64>) -> Self {
        self.max_post = max_post;
        self
    }
}


/// The outcome of a request, reported to the web server in its EndRequest record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    /// The request ran to completion with the given application status,
    /// which works like the exit status of a CGI program.
    Complete(u32),
    /// The request was rejected because the connection cannot take more
    /// requests.
    CantMpxConn,
    /// The request was rejected because the application is out of resources.
    Overloaded,
    /// The request was rejected because the application does not implement
    /// its role.
    UnknownRole,
}

impl ExitStatus {
    /// A successful completion with application status 0.
    pub const SUCCESS: Self = Self::Complete(0);

    /// Converts the status into the body of an EndRequest record.
    #[must_use]
    pub fn to_end_request(self) -> protocol::body::EndRequest {
        use protocol::ProtocolStatus;
        let (app_status, protocol_status) = match self {
            Self::Complete(s) => (s, ProtocolStatus::RequestComplete),
            Self::CantMpxConn => (0, ProtocolStatus::CantMpxConn),
            Self::Overloaded => (0, ProtocolStatus::Overloaded),
            Self::UnknownRole => (0, ProtocolStatus::UnknownRole),
        };
        protocol::body::EndRequest { app_status, protocol_status }
    }
}

impl From<u32> for ExitStatus {
    #[inline]
    fn from(v: u32) -> Self {
        Self::Complete(v)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builders() {
        let n = NonZeroU32::new(3).unwrap();
        let config = Config::with_conns(n)
            .with_multiplex(false)
            .with_max_post(Some(1024))
            .with_upload_dir("/srv/uploads");
        assert_eq!(config.max_conns, n);
        assert_eq!(config.max_reqs, n);
        assert!(!config.multiplex);
        assert_eq!(config.max_post, Some(1024));
        assert_eq!(config.upload_dir, PathBuf::from("/srv/uploads"));
        assert!(Config::default().multiplex);
    }

    #[test]
    fn exit_status() {
        use protocol::ProtocolStatus;
        let end = ExitStatus::from(7).to_end_request();
        assert_eq!((end.app_status, end.protocol_status), (7, ProtocolStatus::RequestComplete));
        let end = ExitStatus::Overloaded.to_end_request();
        assert_eq!((end.app_status, end.protocol_status), (0, ProtocolStatus::Overloaded));
        assert_eq!(ExitStatus::SUCCESS, ExitStatus::Complete(0));
    }
}
