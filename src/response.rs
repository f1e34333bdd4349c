use std::io;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;

use crate::{Error, ExitStatus, Request};


/// A buffered CGI/1.1 response.
///
/// Headers and body are collected in memory and written to a [`Request`]
/// with `Response::send`. The first send emits the `Status` line, all headers
/// and the blank line which ends them. Later sends only write the body data
/// added since the previous send, which allows streaming a response in
/// pieces. Writing a body through [`io::Write`] never fails.
///
/// A `Content-Type` header is required by CGI/1.1 whenever a body is sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    headers_sent: bool,
}

impl Response {
    /// Creates an empty `200 OK` response.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the HTTP status.
    ///
    /// Has no effect on the wire once the headers were sent, but the last
    /// status is still passed on by [`commit`].
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    /// Returns the HTTP status code.
    #[inline]
    #[must_use]
    pub fn http_status(&self) -> u16 {
        self.status.as_u16()
    }

    /// Sets a header, replacing all previous values of the same name.
    ///
    /// Names are case-insensitive and sent in lowercase. `Status` is
    /// reserved, use `Response::status` instead.
    ///
    /// # Errors
    /// Fails with [`Error::InvalidHeader`] if the name is not a valid header
    /// name or the value contains control characters, and with
    /// [`Error::HeadersSent`] after the first `Response::send`.
    pub fn set_header(&mut self, name: &str, value: impl AsRef<[u8]>) -> Result<&mut Self, Error> {
        let (name, value) = self.check_header(name, value.as_ref())?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Adds a header without replacing earlier ones of the same name, as
    /// needed for `Set-Cookie`.
    ///
    /// # Errors
    /// See `Response::set_header`.
    pub fn add_header(&mut self, name: &str, value: impl AsRef<[u8]>) -> Result<&mut Self, Error> {
        let (name, value) = self.check_header(name, value.as_ref())?;
        self.headers.append(name, value);
        Ok(self)
    }

    fn check_header(&self, name: &str, value: &[u8]) -> Result<(HeaderName, HeaderValue), Error> {
        if self.headers_sent {
            return Err(Error::HeadersSent);
        }
        let invalid = || Error::InvalidHeader(name.to_owned());
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
        if header.as_str() == "status" {
            return Err(invalid());
        }
        let value = HeaderValue::from_bytes(value).map_err(|_| invalid())?;
        Ok((header, value))
    }

    /// Returns the first value of a header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.get(name).map(HeaderValue::as_bytes)
    }

    /// Returns all headers set so far.
    #[inline]
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Turns the response into a `302 Found` redirect to `location`.
    ///
    /// `location` is either a local path like `/index.html?page=2`, which the
    /// web server may resolve internally, or an absolute URI. It is not
    /// validated beyond the checks of `Response::set_header`.
    ///
    /// # Errors
    /// See `Response::set_header`.
    pub fn redirect(&mut self, location: &str) -> Result<&mut Self, Error> {
        self.set_header("Location", location)?;
        Ok(self.status(StatusCode::FOUND))
    }

    /// Tests whether the headers were sent.
    #[inline]
    #[must_use]
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Returns the body data which was not sent yet.
    #[inline]
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Writes the response to `req`'s STDOUT stream.
    ///
    /// # Errors
    /// Fails if `req` is not open for writing or the connection fails. The
    /// headers count as sent even then, since a part of them may have reached
    /// the web server.
    pub fn send(&mut self, req: &mut Request) -> Result<(), Error> {
        let mut out = Vec::new();
        if !self.headers_sent {
            self.write_head(&mut out);
            self.headers_sent = true;
        }
        out.append(&mut self.body);
        tracing::debug!(request_id = req.id(), status = self.status.as_u16(), bytes = out.len(), "sending response");
        req.write_stdout_all(&out)
    }

    fn write_head(&self, out: &mut Vec<u8>) {
        let reason = self.status.canonical_reason().unwrap_or("Custom");
        out.extend_from_slice(b"Status: ");
        out.extend_from_slice(self.status.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(reason.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }
}

impl io::Write for Response {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    #[inline]
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.body.extend_from_slice(buf);
        Ok(())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: AsRef<[u8]>> From<http::Response<T>> for Response {
    fn from(response: http::Response<T>) -> Self {
        let (parts, body) = response.into_parts();
        Self { status: parts.status, headers: parts.headers, body: body.as_ref().to_vec(), headers_sent: false }
    }
}


/// Sends `resp` and closes `req` with `app_status`.
///
/// The request is closed even if sending fails, so the web server always
/// receives an EndRequest record if the connection still works. Returns
/// `app_status` on success.
///
/// # Errors
/// Returns the first error of `Response::send` and `Request::close`.
pub fn commit(req: &mut Request, resp: &mut Response, app_status: u32) -> Result<u32, Error> {
    let sent = resp.send(req);
    let closed = req.close(resp.http_status(), ExitStatus::Complete(app_status));
    sent.and(closed).map(|()| app_status)
}
