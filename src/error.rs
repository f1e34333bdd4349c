use std::io;

use crate::protocol as fcgi;


/// The broad class of an [`Error`], which determines its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The web server violated the FastCGI protocol. Only the offending
    /// request is affected, unless a record header could not be decoded.
    Protocol,
    /// The connection failed. All requests multiplexed over it are affected.
    Transport,
    /// A request body could not be parsed. Only that request is affected.
    Form,
    /// The API was used out of order, for example by closing a request twice.
    Misuse,
}

impl ErrorKind {
    /// Returns a short, static description of the error class.
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::Protocol => "FastCGI protocol violation by the web server",
            Self::Transport => "connection to the web server failed",
            Self::Form => "request data could not be parsed",
            Self::Misuse => "request was used in an invalid state",
        }
    }
}


/// Errors raised while serving FastCGI requests.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A record header could not be decoded. The record stream cannot be
    /// resynchronized afterwards, so the connection is unusable.
    #[error("malformed FastCGI record header: {0}")]
    MalformedHeader(#[from] fcgi::Error),
    /// A BeginRequest record named a request ID that is still active.
    #[error("FastCGI request {0} is already active on this connection")]
    DuplicateRequest(u16),
    /// A record named a request ID that is not active.
    #[error("FastCGI request {0} is not active on this connection")]
    UnknownRequest(u16),
    /// A panic inside the record parser left the connection in an
    /// inconsistent state.
    #[error("FastCGI connection state was lost due to an unexpected panic")]
    Paniced,

    /// The web server closed the connection.
    #[error("connection closed by the web server")]
    Eof,
    /// Reading from or writing to the connection failed.
    #[error("connection I/O failed: {0}")]
    Io(#[from] io::Error),
    /// The web server aborted the request.
    #[error("request was aborted by the web server")]
    Aborted,

    /// The POST body has a content type this crate cannot parse.
    #[error("unsupported form content type {0:?}")]
    InvalidFormType(String),
    /// A multipart body ended before its closing boundary, or the content
    /// type did not name a boundary.
    #[error("multipart form boundary not found before end of body")]
    MultipartFormBoundaryNotFound,
    /// A multipart body is malformed.
    #[error("malformed multipart form body: {0}")]
    InvalidMultipart(&'static str),
    /// The POST body is larger than `Config::max_post`.
    #[error("POST body exceeds the limit of {0} bytes")]
    MaxPostExceeded(u64),

    /// The request was closed before.
    #[error("request is already closed")]
    AlreadyClosed,
    /// The request was accepted before and has not been cleared since.
    #[error("request is already accepted")]
    AlreadyAccepted,
    /// The request has not been accepted yet.
    #[error("request is not accepted")]
    NotAccepted,
    /// A response header name or value cannot be sent, for example because
    /// it contains a line break.
    #[error("invalid response header {0:?}")]
    InvalidHeader(String),
    /// Response headers were changed after they had been sent.
    #[error("response headers were already sent")]
    HeadersSent,
}

impl Error {
    /// Returns the class of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            MalformedHeader(_) | DuplicateRequest(_) | UnknownRequest(_) => ErrorKind::Protocol,
            Paniced | Eof | Io(_) | Aborted => ErrorKind::Transport,
            InvalidFormType(_) | MultipartFormBoundaryNotFound | InvalidMultipart(_)
                | MaxPostExceeded(_) => ErrorKind::Form,
            AlreadyClosed | AlreadyAccepted | NotAccepted | InvalidHeader(_) | HeadersSent => ErrorKind::Misuse,
        }
    }

    /// Creates a new [`Error::Io`] with the same kind and message as `e`.
    ///
    /// [`io::Error`] is not [`Clone`], but a connection failure has to be
    /// reported to every request multiplexed over the connection.
    pub(crate) fn io_copy(e: &io::Error) -> Self {
        Self::Io(io::Error::new(e.kind(), e.to_string()))
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        use io::ErrorKind as K;
        let kind = match e {
            Error::Io(inner) => return inner,
            Error::Eof => K::UnexpectedEof,
            Error::Aborted => K::ConnectionAborted,
            Error::NotAccepted => K::NotConnected,
            Error::MaxPostExceeded(_) | Error::InvalidFormType(_) | Error::InvalidHeader(_) => K::InvalidInput,
            Error::AlreadyClosed | Error::AlreadyAccepted | Error::HeadersSent | Error::Paniced => K::Other,
            _ => K::InvalidData,
        };
        io::Error::new(kind, e)
    }
}
