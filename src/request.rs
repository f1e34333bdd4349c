use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use http::HeaderName;

use crate::cgi::{self, OwnedVarName, VarName};
use crate::parser::form::{self, Form};
use crate::parser::multipart::{self, MultipartParser, PartInfo, PartSink};
use crate::protocol::Role;
use crate::{Client, Config, Connection, Error, ExitStatus, SmallBytes};


bitflags::bitflags! {
    /// The steps a [`Request`] has completed since it was last cleared.
    ///
    /// Steps only accumulate. Each one is performed at most once.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Steps: u8 {
        /// A client was bound with `Request::accept`.
        const ACCEPTED = 1 << 0;
        /// The request's BeginRequest record was received.
        const BEGIN_REQUEST_FOUND = 1 << 1;
        /// The PARAMS stream was decoded into the environment.
        const ENV_READ = 1 << 2;
        /// The query string was parsed.
        const GET_READ = 1 << 3;
        /// The POST body was parsed, or skipped for other request methods.
        const POST_READ = 1 << 4;
        /// The `Cookie` header was parsed.
        const COOKIES_READ = 1 << 5;
        /// All four data steps are done.
        const LOADED = 1 << 6;
    }
}

bitflags::bitflags! {
    /// The data `Request::load` should make available.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LoadTargets: u8 {
        /// The CGI environment.
        const ENV = 1 << 0;
        /// Fields of the query string.
        const GET = 1 << 1;
        /// Fields and uploads of a POST body.
        const POST = 1 << 2;
        /// Cookies.
        const COOKIES = 1 << 3;
        /// Everything.
        const ALL = Self::ENV.bits() | Self::GET.bits() | Self::POST.bits() | Self::COOKIES.bits();
    }
}

/// Where a [`Request`] is in its life.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Fresh or cleared, waiting for `Request::accept`.
    #[default]
    Unaccepted,
    /// Bound to a client.
    Accepted,
    /// At least one `Request::load` succeeded.
    Loaded,
    /// The web server aborted the request.
    Aborted,
    /// The request was closed.
    Closed,
}

impl Lifecycle {
    /// Tests whether the request can no longer be loaded.
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Aborted | Self::Closed)
    }
}

/// A file received in a `multipart/form-data` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    /// The form field the file was sent for.
    pub field: String,
    /// The file name chosen by the user agent.
    pub filename: String,
    /// The content type sent along with the file.
    pub content_type: Option<String>,
    /// Where the file was spooled to.
    pub path: PathBuf,
    /// The number of bytes received.
    pub size: u64,
}


/// A FastCGI request, from acceptance to the end of the response.
///
/// Request objects are reused: after a request is closed, `Request::clear`
/// resets all data so the object can be accepted again. Parsing happens on
/// demand through `Request::load`, and the response is written through the
/// [`io::Write`] impl (or with a [`Response`](crate::Response)).
#[derive(Debug)]
pub struct Request {
    config: Arc<Config>,
    client: Option<Client>,
    /// The connection of the last request, kept for reuse if it stays open.
    connection: Option<Arc<Connection>>,
    id: u16,
    role: Option<Role>,
    keep_conn: bool,
    steps: Steps,
    lifecycle: Lifecycle,
    http_status: u16,
    bytes_read: u64,
    bytes_written: u64,
    env: HashMap<OwnedVarName, SmallBytes>,
    get: Form,
    post: Form,
    cookies: Form,
    uploads: Vec<Upload>,
    /// Mixed into spooled file names.
    token: u64,
    upload_seq: u32,
}

impl Request {
    /// Creates an unaccepted request.
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            client: None,
            connection: None,
            id: 0,
            role: None,
            keep_conn: false,
            steps: Steps::empty(),
            lifecycle: Lifecycle::Unaccepted,
            http_status: 200,
            bytes_read: 0,
            bytes_written: 0,
            env: HashMap::new(),
            get: Form::new(),
            post: Form::new(),
            cookies: Form::new(),
            uploads: Vec::new(),
            token: 0,
            upload_seq: 0,
        }
    }

    /// Binds the request to a claimed `client`.
    ///
    /// # Errors
    /// Fails with [`Error::AlreadyAccepted`] unless the request is
    /// [`Lifecycle::Unaccepted`]. The client is dropped in that case, which
    /// ends it with a failure status.
    pub fn accept(&mut self, client: Client) -> Result<(), Error> {
        if self.lifecycle != Lifecycle::Unaccepted {
            return Err(Error::AlreadyAccepted);
        }
        self.id = client.request_id();
        self.role = Some(client.role());
        self.keep_conn = client.keep_connection();
        self.connection = Some(Arc::clone(client.connection()));
        self.client = Some(client);
        self.token = fastrand::u64(..);
        self.upload_seq = 0;
        self.steps |= Steps::ACCEPTED | Steps::BEGIN_REQUEST_FOUND;
        self.lifecycle = Lifecycle::Accepted;
        Ok(())
    }

    /// Parses the data named by `targets`.
    ///
    /// The environment is always read first, since the other targets depend
    /// on it. Targets which were loaded before are skipped, so repeated calls
    /// are cheap. The POST body is only parsed for `POST` requests. For other
    /// methods the target counts as loaded without reading anything.
    ///
    /// # Errors
    /// Fails with [`Error::NotAccepted`], [`Error::AlreadyClosed`] or
    /// [`Error::Aborted`] in the corresponding lifecycle states. Form errors
    /// only affect the target being parsed. Targets loaded before the error
    /// stay loaded.
    pub fn load(&mut self, targets: LoadTargets) -> Result<(), Error> {
        match self.lifecycle {
            Lifecycle::Unaccepted => return Err(Error::NotAccepted),
            Lifecycle::Closed => return Err(Error::AlreadyClosed),
            Lifecycle::Aborted => return Err(Error::Aborted),
            Lifecycle::Accepted | Lifecycle::Loaded => {},
        }
        tracing::debug!(request_id = self.id, ?targets, done = ?self.steps, "loading request");

        let res = self.load_targets(targets);
        if let Err(Error::Aborted) = res {
            self.abort();
        }
        res?;

        if self.steps.contains(Steps::ENV_READ | Steps::GET_READ | Steps::POST_READ | Steps::COOKIES_READ) {
            self.steps |= Steps::LOADED;
        }
        if self.lifecycle == Lifecycle::Accepted {
            self.lifecycle = Lifecycle::Loaded;
        }
        Ok(())
    }

    fn load_targets(&mut self, targets: LoadTargets) -> Result<(), Error> {
        if !targets.is_empty() && !self.steps.contains(Steps::ENV_READ) {
            let client = self.client.as_mut().ok_or(Error::NotAccepted)?;
            let params = client.read_params()?;
            self.env.extend(params);
            self.steps |= Steps::ENV_READ;
        }

        if targets.contains(LoadTargets::GET) && !self.steps.contains(Steps::GET_READ) {
            let query = self.env.get(<&VarName>::from(cgi::QUERY_STRING)).map_or(&[][..], |v| v.as_slice());
            form::parse_urlencoded(query, &mut self.get);
            self.steps |= Steps::GET_READ;
        }

        if targets.contains(LoadTargets::COOKIES) && !self.steps.contains(Steps::COOKIES_READ) {
            let cookies = self.env.get(<&VarName>::from(cgi::HTTP_COOKIE)).map_or(&[][..], |v| v.as_slice());
            form::parse_cookies(cookies, &mut self.cookies);
            self.steps |= Steps::COOKIES_READ;
        }

        if targets.contains(LoadTargets::POST) && !self.steps.contains(Steps::POST_READ) {
            if self.request_method().is_some_and(|m| m.eq_ignore_ascii_case("POST")) {
                self.read_post()?;
            }
            self.steps |= Steps::POST_READ;
        }
        Ok(())
    }

    fn read_post(&mut self) -> Result<(), Error> {
        if let (Some(max), Some(len)) = (self.config.max_post, self.content_length()) {
            if len > max {
                return Err(Error::MaxPostExceeded(max));
            }
        }

        let content_type = self.content_type().unwrap_or_default().to_owned();
        let media_type = content_type.split(';').next().unwrap_or_default().trim();
        if media_type.eq_ignore_ascii_case("application/x-www-form-urlencoded") {
            let mut body = Vec::new();
            let mut buf = vec![0; 8 * 1024];
            loop {
                match self.read_body(&mut buf)? {
                    0 => break,
                    n => body.extend_from_slice(&buf[..n]),
                }
            }
            let fields = form::parse_urlencoded(&body, &mut self.post);
            tracing::debug!(request_id = self.id, fields, bytes = body.len(), "urlencoded body parsed");
            Ok(())
        } else if media_type.eq_ignore_ascii_case("multipart/form-data") {
            let boundary = multipart::boundary_from_content_type(&content_type)
                .ok_or(Error::MultipartFormBoundaryNotFound)?;
            self.read_multipart(&boundary)
        } else if media_type.is_empty() && self.content_length().unwrap_or(0) == 0 {
            // A POST without a body
            Ok(())
        } else {
            Err(Error::InvalidFormType(content_type))
        }
    }

    fn read_multipart(&mut self, boundary: &str) -> Result<(), Error> {
        let mut parser = MultipartParser::new(boundary);
        let mut sink = SpoolSink::new(self.id, self.config.upload_dir.clone(), self.token, self.upload_seq);
        let mut buf = vec![0; 8 * 1024];
        let res = loop {
            let n = match self.read_body(&mut buf) {
                Ok(n) => n,
                Err(e) => break Err(e),
            };
            if n == 0 {
                break parser.finish();
            }
            if let Err(e) = parser.feed(&buf[..n], &mut sink) {
                break Err(e);
            }
        };

        // Partial uploads are recorded too, so that clear() deletes them
        self.upload_seq = sink.seq;
        self.post.extend(std::mem::take(&mut sink.fields));
        self.uploads.append(&mut sink.uploads);
        res?;

        tracing::debug!(
            request_id = self.id, fields = self.post.len(), uploads = self.uploads.len(),
            bytes = parser.consumed(), "multipart body parsed",
        );
        Ok(())
    }

    /// Reads from STDIN, enforcing `Config::max_post`.
    fn read_body(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let client = self.client.as_mut().ok_or(Error::NotAccepted)?;
        let n = client.read_some(buf)?;
        self.bytes_read += n as u64;
        match self.config.max_post {
            Some(max) if self.bytes_read > max => Err(Error::MaxPostExceeded(max)),
            _ => Ok(n),
        }
    }

    /// Ends the request with the given HTTP and exit status.
    ///
    /// The HTTP status is only recorded. Use a [`Response`](crate::Response)
    /// to send it to the web server. Aborted requests can still be closed,
    /// since the web server waits for their EndRequest record.
    ///
    /// # Errors
    /// Fails with [`Error::NotAccepted`] or [`Error::AlreadyClosed`] in the
    /// corresponding lifecycle states. Write errors are forwarded, but the
    /// request counts as closed.
    pub fn close(&mut self, http_status: u16, status: ExitStatus) -> Result<(), Error> {
        match self.lifecycle {
            Lifecycle::Unaccepted => return Err(Error::NotAccepted),
            Lifecycle::Closed => return Err(Error::AlreadyClosed),
            _ => {},
        }
        self.http_status = http_status;
        self.lifecycle = Lifecycle::Closed;
        let mut client = self.client.take().ok_or(Error::NotAccepted)?;
        client.close(status)
    }

    /// Marks the request as aborted by the web server.
    pub fn abort(&mut self) {
        if !self.lifecycle.is_terminal() {
            tracing::debug!(request_id = self.id, "request aborted");
            self.lifecycle = Lifecycle::Aborted;
        }
    }

    /// Resets the request for reuse.
    ///
    /// All parsed data is dropped and spooled uploads are deleted, unless
    /// `Config::keep_uploads` is set. The connection is kept if the web
    /// server asked for it and it is still open. An unclosed request is ended
    /// with a failure status.
    pub fn clear(&mut self) {
        self.remove_uploads();
        self.client = None;
        if !self.keep_conn || !self.connection.as_ref().is_some_and(|c| c.is_open()) {
            self.connection = None;
        }
        self.id = 0;
        self.role = None;
        self.keep_conn = false;
        self.steps = Steps::empty();
        self.lifecycle = Lifecycle::Unaccepted;
        self.http_status = 200;
        self.bytes_read = 0;
        self.bytes_written = 0;
        self.env.clear();
        self.get.clear();
        self.post.clear();
        self.cookies.clear();
    }

    fn remove_uploads(&mut self) {
        if self.config.keep_uploads {
            self.uploads.clear();
            return;
        }
        for upload in self.uploads.drain(..) {
            if let Err(e) = std::fs::remove_file(&upload.path) {
                tracing::warn!(path = %upload.path.display(), error = %e, "failed to delete upload");
            }
        }
    }

    /// Takes the connection kept from the previous request.
    pub(crate) fn take_connection(&mut self) -> Option<Arc<Connection>> {
        self.connection.take()
    }

    /// Writes a prefix of `buf` to the STDERR stream, which web servers
    /// usually copy to their error log.
    ///
    /// # Errors
    /// Fails with [`Error::NotAccepted`] or [`Error::AlreadyClosed`] outside
    /// of an open request. Write errors are fatal to the connection.
    pub fn write_stderr(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.writable_client()?.write_stderr(buf)
    }

    /// Writes all of `buf` to the STDOUT stream.
    pub(crate) fn write_stdout_all(&mut self, mut buf: &[u8]) -> Result<(), Error> {
        while !buf.is_empty() {
            let n = self.writable_client()?.write_some(buf)?;
            self.bytes_written += n as u64;
            buf = &buf[n..];
        }
        Ok(())
    }

    fn writable_client(&mut self) -> Result<&mut Client, Error> {
        match self.lifecycle {
            Lifecycle::Unaccepted => Err(Error::NotAccepted),
            Lifecycle::Closed => Err(Error::AlreadyClosed),
            _ => self.client.as_mut().ok_or(Error::NotAccepted),
        }
    }


    /// Returns the FastCGI request ID, or 0 if not accepted.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Returns the role of an accepted request.
    #[inline]
    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Tests whether the web server asked to keep the connection open.
    #[inline]
    #[must_use]
    pub fn keep_connection(&self) -> bool {
        self.keep_conn
    }

    /// Returns the steps completed since the last `Request::clear`.
    #[inline]
    #[must_use]
    pub fn steps(&self) -> Steps {
        self.steps
    }

    /// Returns the current lifecycle state.
    #[inline]
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Tests whether the request was accepted and is neither closed nor aborted.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Accepted | Lifecycle::Loaded)
    }

    /// Returns the HTTP status passed to `Request::close`, or 200.
    #[inline]
    #[must_use]
    pub fn http_status(&self) -> u16 {
        self.http_status
    }

    /// Returns the number of STDIN bytes read so far.
    #[inline]
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Returns the number of STDOUT bytes written so far.
    #[inline]
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Returns the connection the request arrived on.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    /// Returns the value of an environment variable.
    ///
    /// Names are compared case-insensitively. See [`cgi::VarName`] for the
    /// types that can be passed as `name`.
    #[must_use]
    pub fn var<'i, S>(&self, name: S) -> Option<&[u8]>
    where
        S: Into<&'i VarName>,
    {
        self.env.get(name.into()).map(SmallBytes::as_slice)
    }

    /// Returns the value of an environment variable if it is valid UTF-8.
    #[must_use]
    pub fn var_str<'i, S>(&self, name: S) -> Option<&str>
    where
        S: Into<&'i VarName>,
    {
        self.var(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Returns an iterator over the environment, in no particular order.
    pub fn env(&self) -> impl Iterator<Item = (&VarName, &[u8])> + '_ {
        self.env.iter().map(|(k, v)| (std::borrow::Borrow::borrow(k), v.as_slice()))
    }

    /// Returns the number of environment variables.
    #[inline]
    #[must_use]
    pub fn env_len(&self) -> usize {
        self.env.len()
    }

    /// Returns an HTTP request header passed on by the web server.
    ///
    /// Web servers only forward the headers they are configured to, as
    /// `HTTP_*` variables plus `CONTENT_TYPE` and `CONTENT_LENGTH`.
    #[must_use]
    pub fn header(&self, name: &HeaderName) -> Option<&[u8]> {
        self.env.get(&OwnedVarName::from_header(name)).map(SmallBytes::as_slice)
    }

    /// Returns an iterator over all HTTP request headers in the environment.
    pub fn headers(&self) -> impl Iterator<Item = (HeaderName, &[u8])> + '_ {
        self.env.iter().filter_map(|(k, v)| Some((k.as_var_name().header_name()?, v.as_slice())))
    }

    /// Returns `REQUEST_METHOD`.
    #[must_use]
    pub fn request_method(&self) -> Option<&str> {
        self.var_str(cgi::REQUEST_METHOD)
    }

    /// Returns `QUERY_STRING`.
    #[must_use]
    pub fn query_string(&self) -> Option<&str> {
        self.var_str(cgi::QUERY_STRING)
    }

    /// Returns `CONTENT_TYPE`.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.var_str(cgi::CONTENT_TYPE)
    }

    /// Returns `CONTENT_LENGTH`, if it is set and a valid number.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.var_str(cgi::CONTENT_LENGTH).and_then(|v| v.trim().parse().ok())
    }

    /// Returns `REMOTE_ADDR`.
    #[must_use]
    pub fn remote_addr(&self) -> Option<&str> {
        self.var_str(cgi::REMOTE_ADDR)
    }

    /// Returns `SCRIPT_NAME`.
    #[must_use]
    pub fn script_name(&self) -> Option<&str> {
        self.var_str(cgi::SCRIPT_NAME)
    }

    /// Returns `PATH_INFO`.
    #[must_use]
    pub fn path_info(&self) -> Option<&str> {
        self.var_str(cgi::PATH_INFO)
    }

    /// Returns `REQUEST_URI`, a common extension of CGI/1.1.
    #[must_use]
    pub fn request_uri(&self) -> Option<&str> {
        self.var_str(cgi::REQUEST_URI)
    }

    /// Returns `SERVER_NAME`.
    #[must_use]
    pub fn server_name(&self) -> Option<&str> {
        self.var_str(cgi::SERVER_NAME)
    }

    /// Returns the fields of the query string.
    #[inline]
    #[must_use]
    pub fn get(&self) -> &Form {
        &self.get
    }

    /// Returns the non-file fields of the POST body.
    #[inline]
    #[must_use]
    pub fn post(&self) -> &Form {
        &self.post
    }

    /// Returns the cookies sent with the request.
    #[inline]
    #[must_use]
    pub fn cookies(&self) -> &Form {
        &self.cookies
    }

    /// Returns all uploaded files in arrival order.
    #[inline]
    #[must_use]
    pub fn uploads(&self) -> &[Upload] {
        &self.uploads
    }

    /// Returns the first file uploaded for `field`.
    #[must_use]
    pub fn upload(&self, field: &str) -> Option<&Upload> {
        self.uploads.iter().find(|u| u.field == field)
    }
}

/// Reads raw STDIN data, bypassing the POST parser.
impl io::Read for Request {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let client = self.client.as_mut().ok_or(Error::NotAccepted)?;
        let n = client.read_some(buf)?;
        self.bytes_read += n as u64;
        Ok(n)
    }
}

/// Writes to the STDOUT stream. Every call produces one record.
impl io::Write for Request {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writable_client()?.write_some(buf)?;
        self.bytes_written += n as u64;
        Ok(n)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.remove_uploads();
    }
}


enum Part {
    Skip,
    Field { name: String, value: Vec<u8> },
    File { index: usize, out: BufWriter<File> },
}

/// Collects multipart fields and spools files to disk.
struct SpoolSink {
    request_id: u16,
    dir: PathBuf,
    token: u64,
    seq: u32,
    fields: Vec<(String, String)>,
    uploads: Vec<Upload>,
    current: Part,
}

impl SpoolSink {
    fn new(request_id: u16, dir: PathBuf, token: u64, seq: u32) -> Self {
        Self { request_id, dir, token, seq, fields: Vec::new(), uploads: Vec::new(), current: Part::Skip }
    }
}

impl PartSink for SpoolSink {
    fn begin_part(&mut self, part: &PartInfo) -> Result<(), Error> {
        self.current = match &part.filename {
            _ if part.name.is_empty() => Part::Skip,
            None => Part::Field { name: part.name.clone(), value: Vec::new() },
            // A file input without a selected file
            Some(filename) if filename.is_empty() => Part::Skip,
            Some(filename) => {
                self.seq += 1;
                let path = self.dir.join(format!("fcgi-upload-{:016x}-{}", self.token, self.seq));
                let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
                tracing::debug!(
                    request_id = self.request_id, field = %part.name, path = %path.display(),
                    "spooling upload",
                );
                self.uploads.push(Upload {
                    field: part.name.clone(),
                    filename: filename.clone(),
                    content_type: part.content_type.clone(),
                    path,
                    size: 0,
                });
                Part::File { index: self.uploads.len() - 1, out: BufWriter::new(file) }
            },
        };
        Ok(())
    }

    fn part_data(&mut self, data: &[u8]) -> Result<(), Error> {
        match &mut self.current {
            Part::Skip => {},
            Part::Field { value, .. } => value.extend_from_slice(data),
            Part::File { index, out } => {
                out.write_all(data)?;
                self.uploads[*index].size += data.len() as u64;
            },
        }
        Ok(())
    }

    fn end_part(&mut self) -> Result<(), Error> {
        match std::mem::replace(&mut self.current, Part::Skip) {
            Part::Skip => {},
            Part::Field { name, value } => {
                self.fields.push((name, String::from_utf8_lossy(&value).into_owned()));
            },
            Part::File { mut out, .. } => out.flush()?,
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::io::{Read as _, Write as _};
    use std::num::NonZeroUsize;
    use std::path::Path;

    use super::*;
    use crate::protocol::{ProtocolStatus, RecordType};
    use crate::test_support::{self, accepted, request_input as input};
    use crate::transport::MemoryTransport;

    fn upload_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fastcgi-app-test-{:016x}", fastrand::u64(..)));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn multipart_body(file: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend(b"--XyZ\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nHello\r\n");
        body.extend(b"--XyZ\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.bin\"\r\n");
        body.extend(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend(file);
        body.extend(b"\r\n--XyZ\r\nContent-Disposition: form-data; name=\"empty\"; filename=\"\"\r\n\r\n");
        body.extend(b"\r\n--XyZ--\r\n");
        body
    }

    #[test]
    fn get_request() -> Result<(), Error> {
        let params: &[(&[u8], &[u8])] = &[
            (b"REQUEST_METHOD", b"GET"),
            (b"QUERY_STRING", b"a=1&b=x%20y&a=2"),
            (b"HTTP_COOKIE", b"sid=abc; theme=dark"),
            (b"SCRIPT_NAME", b"/index.php"),
            (b"HTTP_X_REQUEST_ID", b"42"),
        ];
        let (mut req, transport) = accepted(&input(false, params, b""), Config::default())?;
        assert_eq!(req.lifecycle(), Lifecycle::Accepted);
        assert!(req.steps().contains(Steps::ACCEPTED | Steps::BEGIN_REQUEST_FOUND));

        req.load(LoadTargets::ALL)?;
        assert_eq!(req.lifecycle(), Lifecycle::Loaded);
        assert!(req.steps().contains(Steps::LOADED));
        assert_eq!(req.request_method(), Some("GET"));
        assert_eq!(req.var_str("script_name"), Some("/index.php"));
        assert_eq!(req.env_len(), 5);
        assert_eq!(req.header(&HeaderName::from_static("x-request-id")), Some(&b"42"[..]));
        assert_eq!(req.header(&http::header::COOKIE), Some(&b"sid=abc; theme=dark"[..]));
        let mut headers: Vec<_> = req.headers().map(|(name, _)| name).collect();
        headers.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(headers, [http::header::COOKIE, HeaderName::from_static("x-request-id")]);
        assert_eq!(req.get().get_all("a").collect::<Vec<_>>(), ["1", "2"]);
        assert_eq!(req.get().get("b"), Some("x y"));
        assert_eq!(req.cookies().get("theme"), Some("dark"));
        assert!(req.post().is_empty());
        assert_eq!(req.bytes_read(), 0);

        req.write_all(b"Status: 204 No Content\r\n\r\n")?;
        req.close(204, ExitStatus::SUCCESS)?;
        assert_eq!(req.http_status(), 204);
        let out = transport.take_output();
        assert_eq!(test_support::stream_of(&out, 1, RecordType::Stdout), b"Status: 204 No Content\r\n\r\n");
        assert_eq!(test_support::end_requests(&out).len(), 1);
        Ok(())
    }

    #[test]
    fn urlencoded_post() -> Result<(), Error> {
        let body = b"name=J%C3%BCrgen&tags=a&tags=b+c";
        let len = body.len().to_string();
        let params: &[(&[u8], &[u8])] = &[
            (b"REQUEST_METHOD", b"POST"),
            (b"CONTENT_TYPE", b"Application/X-WWW-Form-Urlencoded; charset=UTF-8"),
            (b"CONTENT_LENGTH", len.as_bytes()),
        ];
        let (mut req, _transport) = accepted(&input(false, params, body), Config::default())?;
        req.load(LoadTargets::POST)?;
        // The environment is always loaded first
        assert!(req.steps().contains(Steps::ENV_READ | Steps::POST_READ));
        assert!(!req.steps().contains(Steps::GET_READ | Steps::LOADED));
        assert_eq!(req.post().get("name"), Some("Jürgen"));
        assert_eq!(req.post().get_all("tags").collect::<Vec<_>>(), ["a", "b c"]);
        assert_eq!(req.bytes_read(), body.len() as u64);
        req.close(200, ExitStatus::SUCCESS)
    }

    #[test]
    fn repeated_loads() -> Result<(), Error> {
        let params: &[(&[u8], &[u8])] = &[(b"REQUEST_METHOD", b"GET"), (b"QUERY_STRING", b"k=v")];
        let (mut req, _transport) = accepted(&input(false, params, b""), Config::default())?;
        req.load(LoadTargets::ENV | LoadTargets::GET)?;
        req.load(LoadTargets::ENV | LoadTargets::GET)?;
        assert_eq!(req.get().len(), 1);
        assert_eq!(req.env_len(), 2);
        req.load(LoadTargets::ALL)?;
        assert!(req.steps().contains(Steps::LOADED));
        req.close(200, ExitStatus::SUCCESS)
    }

    #[test]
    fn multipart_uploads() -> Result<(), Error> {
        let dir = upload_dir();
        let file: Vec<u8> = std::iter::repeat_with(|| fastrand::u8(..)).take(3000).collect();
        let body = multipart_body(&file);
        let len = body.len().to_string();
        let params: &[(&[u8], &[u8])] = &[
            (b"REQUEST_METHOD", b"POST"),
            (b"CONTENT_TYPE", b"multipart/form-data; boundary=\"XyZ\""),
            (b"CONTENT_LENGTH", len.as_bytes()),
        ];

        let config = Config::default().with_upload_dir(&dir);
        let (mut req, _transport) = accepted(&input(true, params, &body), config)?;
        req.load(LoadTargets::ALL)?;
        assert_eq!(req.post().get("title"), Some("Hello"));
        assert!(!req.post().contains("file"));
        assert_eq!(req.uploads().len(), 1);

        let upload = req.upload("file").ok_or(Error::NotAccepted)?;
        assert_eq!(upload.filename, "a.bin");
        assert_eq!(upload.content_type.as_deref(), Some("application/octet-stream"));
        assert_eq!(upload.size, 3000);
        assert_eq!(std::fs::read(&upload.path)?, file);
        assert!(upload.path.starts_with(&dir));
        let path = upload.path.clone();

        req.close(200, ExitStatus::SUCCESS)?;
        req.clear();
        assert!(!path.exists());
        assert!(req.uploads().is_empty());
        // keep_conn was set and the connection is still open
        assert!(req.connection().is_some());
        assert_eq!(req.lifecycle(), Lifecycle::Unaccepted);

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn kept_uploads() -> Result<(), Error> {
        let dir = upload_dir();
        let body = multipart_body(b"kept");
        let params: &[(&[u8], &[u8])] =
            &[(b"REQUEST_METHOD", b"POST"), (b"CONTENT_TYPE", b"multipart/form-data; boundary=XyZ")];

        let config = Config::default().with_upload_dir(&dir).with_keep_uploads(true);
        let (mut req, _transport) = accepted(&input(false, params, &body), config)?;
        req.load(LoadTargets::POST)?;
        let path = req.upload("file").map(|u| u.path.clone()).ok_or(Error::NotAccepted)?;
        req.close(200, ExitStatus::SUCCESS)?;
        req.clear();
        assert!(req.connection().is_none());
        drop(req);
        assert_eq!(std::fs::read(&path)?, b"kept");

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn form_errors() -> Result<(), Error> {
        let params: &[(&[u8], &[u8])] = &[(b"REQUEST_METHOD", b"POST"), (b"CONTENT_TYPE", b"application/json")];
        let (mut req, _t) = accepted(&input(false, params, b"{}"), Config::default())?;
        assert!(matches!(req.load(LoadTargets::ALL), Err(Error::InvalidFormType(t)) if t == "application/json"));
        // Other targets are unaffected
        assert!(req.steps().contains(Steps::ENV_READ | Steps::GET_READ | Steps::COOKIES_READ));
        assert!(!req.steps().contains(Steps::POST_READ));
        req.close(400, ExitStatus::Complete(1))?;

        let params: &[(&[u8], &[u8])] =
            &[(b"REQUEST_METHOD", b"POST"), (b"CONTENT_TYPE", b"multipart/form-data")];
        let (mut req, _t) = accepted(&input(false, params, b"--a--"), Config::default())?;
        assert!(matches!(req.load(LoadTargets::POST), Err(Error::MultipartFormBoundaryNotFound)));
        req.close(400, ExitStatus::Complete(1))?;

        let params: &[(&[u8], &[u8])] = &[
            (b"REQUEST_METHOD", b"POST"),
            (b"CONTENT_TYPE", b"application/x-www-form-urlencoded"),
            (b"CONTENT_LENGTH", b"100"),
        ];
        let config = Config::default().with_max_post(Some(10));
        let (mut req, _t) = accepted(&input(false, params, b"a=1"), config.clone())?;
        assert!(matches!(req.load(LoadTargets::POST), Err(Error::MaxPostExceeded(10))));
        req.close(413, ExitStatus::Complete(1))?;

        // Without CONTENT_LENGTH the limit is enforced while reading
        let params: &[(&[u8], &[u8])] =
            &[(b"REQUEST_METHOD", b"POST"), (b"CONTENT_TYPE", b"application/x-www-form-urlencoded")];
        let (mut req, _t) = accepted(&input(false, params, b"a=0123456789"), config)?;
        assert!(matches!(req.load(LoadTargets::POST), Err(Error::MaxPostExceeded(10))));
        req.close(413, ExitStatus::Complete(1))
    }

    #[test]
    fn misuse() -> Result<(), Error> {
        let params: &[(&[u8], &[u8])] = &[(b"REQUEST_METHOD", b"GET")];
        let mut input = input(true, params, b"");
        test_support::add_begin(&mut input, 2, Role::Responder, false);
        test_support::add_params(&mut input, 2, &[], 1);
        let transport = Arc::new(MemoryTransport::with_input(&input));
        let config = Arc::new(Config::default());
        let conn = Connection::new(transport.clone(), Arc::clone(&config));

        let mut req = Request::new(Arc::clone(&config));
        assert!(matches!(req.load(LoadTargets::ENV), Err(Error::NotAccepted)));
        assert!(matches!(req.close(200, ExitStatus::SUCCESS), Err(Error::NotAccepted)));
        assert!(req.write_all(b"x").is_err());
        assert!(!req.is_open());

        req.accept(conn.next_request()?.ok_or(Error::Eof)?)?;
        assert!(req.is_open());
        // The second client is dropped, which ends request 2 with status 1
        assert!(matches!(req.accept(conn.next_request()?.ok_or(Error::Eof)?), Err(Error::AlreadyAccepted)));

        req.close(200, ExitStatus::SUCCESS)?;
        assert!(matches!(req.close(200, ExitStatus::SUCCESS), Err(Error::AlreadyClosed)));
        assert!(matches!(req.load(LoadTargets::ENV), Err(Error::AlreadyClosed)));
        assert!(matches!(req.write_stderr(b"late"), Err(Error::AlreadyClosed)));

        let ends: Vec<_> = test_support::end_requests(&transport.take_output())
            .into_iter()
            .map(|(id, e)| (id, e.app_status))
            .collect();
        assert_eq!(ends, [(2, 1), (1, 0)]);
        Ok(())
    }

    #[test]
    fn aborted_request() -> Result<(), Error> {
        let mut input = Vec::new();
        test_support::add_begin(&mut input, 1, Role::Responder, false);
        let params: &[(&[u8], &[u8])] =
            &[(b"REQUEST_METHOD", b"POST"), (b"CONTENT_TYPE", b"application/x-www-form-urlencoded")];
        test_support::add_params(&mut input, 1, params, 4);
        let (mut req, transport) = accepted(&input, Config::default())?;
        req.load(LoadTargets::ENV)?;

        let mut abort = Vec::new();
        test_support::add_abort(&mut abort, 1);
        transport.push_input(&abort);
        assert!(matches!(req.load(LoadTargets::POST), Err(Error::Aborted)));
        assert_eq!(req.lifecycle(), Lifecycle::Aborted);
        assert!(!req.is_open());
        assert!(matches!(req.load(LoadTargets::GET), Err(Error::Aborted)));

        // The web server still expects an EndRequest record
        req.close(500, ExitStatus::Complete(2))?;
        let ends = test_support::end_requests(&transport.take_output());
        assert_eq!(ends.len(), 1);
        assert_eq!((ends[0].1.app_status, ends[0].1.protocol_status), (2, ProtocolStatus::RequestComplete));
        Ok(())
    }

    #[test]
    fn raw_io_and_stderr() -> Result<(), Error> {
        let params: &[(&[u8], &[u8])] = &[(b"REQUEST_METHOD", b"PUT")];
        let (mut req, transport) = accepted(&input(false, params, b"raw body"), Config::default())?;
        req.load(LoadTargets::ALL)?;
        let mut body = String::new();
        req.read_to_string(&mut body)?;
        assert_eq!(body, "raw body");
        assert_eq!(req.bytes_read(), 8);

        assert_eq!(req.write_stderr(b"warning")?, 7);
        write!(req, "Content-Type: text/plain\r\n\r\nok")?;
        assert_eq!(req.bytes_written(), 30);
        req.close(200, ExitStatus::SUCCESS)?;

        let out = transport.take_output();
        assert_eq!(test_support::stream_of(&out, 1, RecordType::Stderr), b"warning");
        assert_eq!(test_support::stream_of(&out, 1, RecordType::Stdout), b"Content-Type: text/plain\r\n\r\nok");
        Ok(())
    }

    #[test]
    fn byte_by_byte() -> Result<(), Error> {
        let dir = upload_dir();
        let body = multipart_body(b"\r\n--XyX\r\n--Xy\r\n-");
        let params: &[(&[u8], &[u8])] = &[
            (b"REQUEST_METHOD", b"POST"),
            (b"CONTENT_TYPE", b"multipart/form-data; boundary=XyZ"),
            (b"QUERY_STRING", b"page=2"),
        ];
        let config = Config::default().with_upload_dir(&dir).with_buffer_size(NonZeroUsize::MIN);
        let (mut req, _transport) = accepted(&input(false, params, &body), config)?;
        req.load(LoadTargets::ALL)?;
        assert_eq!(req.get().get("page"), Some("2"));
        assert_eq!(req.post().get("title"), Some("Hello"));
        let upload = req.upload("file").ok_or(Error::NotAccepted)?;
        assert_eq!(std::fs::read(&upload.path)?, b"\r\n--XyX\r\n--Xy\r\n-");
        req.close(200, ExitStatus::SUCCESS)?;
        req.clear();
        assert!(is_empty_dir(&dir)?);

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    fn is_empty_dir(dir: &Path) -> io::Result<bool> {
        Ok(std::fs::read_dir(dir)?.next().is_none())
    }
}
