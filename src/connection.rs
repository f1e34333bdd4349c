use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::cgi::OwnedVarName;
use crate::parser::{Demux, Event, ParamsDecoder};
use crate::protocol::{self as fcgi, body, RecordHeader, RecordType};
use crate::transport::Transport;
use crate::{Config, Error, ExitStatus, SmallBytes};


static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// The reason a connection stopped delivering records.
#[derive(Debug)]
enum Failure {
    Eof,
    Io(io::Error),
    Header(fcgi::Error),
    Paniced,
}

impl Failure {
    fn from_error(e: Error) -> Self {
        match e {
            Error::MalformedHeader(h) => Self::Header(h),
            Error::Io(e) => Self::Io(e),
            Error::Eof => Self::Eof,
            _ => Self::Paniced,
        }
    }

    fn to_error(&self) -> Error {
        match self {
            Self::Eof => Error::Eof,
            Self::Io(e) => Error::io_copy(e),
            Self::Header(h) => Error::MalformedHeader(h.clone()),
            Self::Paniced => Error::Paniced,
        }
    }
}


/// Inbound state of one request on a connection.
#[derive(Debug)]
struct Slot {
    role: fcgi::Role,
    flags: fcgi::RequestFlags,
    env: Vec<(OwnedVarName, SmallBytes)>,
    params: ParamsDecoder,
    params_done: bool,
    stdin: VecDeque<u8>,
    /// Total STDIN bytes received, including those already read.
    stdin_len: u64,
    stdin_done: bool,
    /// More STDIN arrived than `Config::max_post` allows. Buffered data was
    /// dropped and the rest of the stream is discarded.
    over_limit: bool,
    aborted: bool,
    claimed: bool,
}

impl Slot {
    fn new(begin: body::BeginRequest) -> Self {
        Self {
            role: begin.role,
            flags: begin.flags,
            env: Vec::new(),
            params: ParamsDecoder::new(),
            params_done: false,
            stdin: VecDeque::new(),
            stdin_len: 0,
            stdin_done: false,
            over_limit: false,
            aborted: false,
            claimed: false,
        }
    }

    /// Tests whether all input of the request has arrived.
    fn is_loaded(&self) -> bool {
        self.aborted || (self.params_done && (self.stdin_done || self.over_limit || !self.role.has_stdin()))
    }
}

#[derive(Debug)]
struct ConnState {
    demux: Demux,
    slots: HashMap<u16, Slot>,
    /// Requests which began but were not claimed yet, in arrival order.
    pending: VecDeque<u16>,
    /// Set while some thread reads from the transport.
    pumping: bool,
    /// Input is supplied through `Connection::feed` instead of being read.
    fed: bool,
    /// A request without `KeepConn` was closed. No new requests are served
    /// and the transport is closed once the last slot is released.
    closing: bool,
    failure: Option<Failure>,
    read_buf: Vec<u8>,
}


/// A FastCGI connection to the web server.
///
/// The connection splits the record stream into per-request slots, keyed by
/// request ID. Each slot buffers the PARAMS and STDIN data of its request
/// until the owning [`Client`] asks for it. Reading is cooperative: whichever
/// client needs data first reads one chunk from the transport and dispatches
/// it, while all others wait for it to finish. Output records are written
/// under a separate lock, so records of concurrently served requests never
/// interleave.
pub struct Connection {
    id: u64,
    transport: Arc<dyn Transport>,
    config: Arc<Config>,
    state: Mutex<ConnState>,
    readable: Condvar,
    write_lock: Mutex<()>,
}

impl Connection {
    /// Creates a connection which reads records from `transport` on demand.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: Arc<Config>) -> Arc<Self> {
        Self::with_mode(transport, config, false)
    }

    /// Creates a connection whose input is supplied with `Connection::feed`.
    ///
    /// Output is still written to `transport`. Operations which would have to
    /// wait for more input fail with [`io::ErrorKind::WouldBlock`] instead.
    #[must_use]
    pub fn fed(transport: Arc<dyn Transport>, config: Arc<Config>) -> Arc<Self> {
        Self::with_mode(transport, config, true)
    }

    fn with_mode(transport: Arc<dyn Transport>, config: Arc<Config>, fed: bool) -> Arc<Self> {
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(conn = id, fed, "new connection");
        let state = ConnState {
            demux: Demux::new(),
            slots: HashMap::new(),
            pending: VecDeque::new(),
            pumping: false,
            fed,
            closing: false,
            failure: None,
            read_buf: Vec::new(),
        };
        Arc::new(Self {
            id,
            transport,
            config,
            state: Mutex::new(state),
            readable: Condvar::new(),
            write_lock: Mutex::new(()),
        })
    }

    /// Returns a process-unique number identifying the connection in logs.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Tests whether the connection can still serve requests.
    ///
    /// This is false after a transport failure, after the web server closed
    /// the connection, and after a request without `KeepConn` was closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        let state = self.state();
        self.transport.is_open() && state.failure.is_none() && !state.closing
    }

    /// Returns the number of requests which began and were not released yet.
    #[must_use]
    pub fn active_requests(&self) -> usize {
        self.state().slots.len()
    }

    /// Waits for the next request and claims it.
    ///
    /// Returns `Ok(None)` if the web server closed the connection or a
    /// request without `KeepConn` was closed, so no further requests follow.
    ///
    /// # Errors
    /// Fails if reading from the transport fails or a record header cannot be
    /// decoded. Requests rejected during the wait (for an unknown role or
    /// when overloaded) are answered internally and do not surface here.
    pub fn next_request(self: &Arc<Self>) -> Result<Option<Client>, Error> {
        let state = self.state();
        match self.wait_until(state, |s| !s.pending.is_empty() || s.closing) {
            Ok(mut state) => Ok(self.claim(&mut state, |_| true)),
            Err(Error::Eof) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Claims a request which already began, without waiting.
    #[must_use]
    pub fn try_claim(self: &Arc<Self>) -> Option<Client> {
        let mut state = self.state();
        self.claim(&mut state, |_| true)
    }

    /// Claims a request whose input has been received completely, or which
    /// was aborted, without waiting.
    #[must_use]
    pub fn claim_loaded(self: &Arc<Self>) -> Option<Client> {
        let mut state = self.state();
        self.claim(&mut state, Slot::is_loaded)
    }

    /// Dispatches `data` received from the web server.
    ///
    /// Replies to management records and rejected requests are written to the
    /// transport before returning.
    ///
    /// # Errors
    /// Fails if a record header cannot be decoded, if replies cannot be
    /// written, or if the connection failed before.
    pub fn feed(&self, data: &[u8]) -> Result<(), Error> {
        let mut state = self.state();
        if let Some(f) = &state.failure {
            return Err(f.to_error());
        }
        let mut replies = Vec::new();
        self.ingest(&mut state, data, &mut replies);
        let failed = state.failure.as_ref().map(Failure::to_error);
        self.readable.notify_all();
        drop(state);

        if !replies.is_empty() {
            self.lock().write_raw(&replies)?;
        }
        failed.map_or(Ok(()), Err)
    }

    /// Marks the end of the data supplied through `Connection::feed`.
    pub fn feed_eof(&self) {
        let mut state = self.state();
        state.failure.get_or_insert(Failure::Eof);
        self.readable.notify_all();
    }

    /// Locks the connection for writing records.
    ///
    /// While the returned guard lives, no other request can write to the
    /// connection.
    #[must_use]
    pub fn lock(&self) -> WriteGuard<'_> {
        let lock = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        WriteGuard { conn: self, _lock: lock }
    }

    #[inline]
    fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until `ready` holds, reading from the transport as necessary.
    fn wait_until<'a>(
        &'a self,
        mut state: MutexGuard<'a, ConnState>,
        mut ready: impl FnMut(&ConnState) -> bool,
    ) -> Result<MutexGuard<'a, ConnState>, Error> {
        loop {
            if ready(&state) {
                return Ok(state);
            }
            if let Some(f) = &state.failure {
                return Err(f.to_error());
            }
            if state.fed {
                return Err(io::Error::from(io::ErrorKind::WouldBlock).into());
            }
            state = if state.pumping {
                self.readable.wait(state).unwrap_or_else(PoisonError::into_inner)
            } else {
                self.pump(state)
            };
        }
    }

    /// Reads one chunk from the transport and dispatches it to the slots.
    /// The state lock is released while reading.
    fn pump<'a>(&'a self, mut state: MutexGuard<'a, ConnState>) -> MutexGuard<'a, ConnState> {
        state.pumping = true;
        let mut buf = std::mem::take(&mut state.read_buf);
        buf.resize(self.config.buffer_size.get(), 0);
        drop(state);

        let res = loop {
            match self.transport.read_some(&mut buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                res => break res,
            }
        };

        let mut state = self.state();
        state.pumping = false;
        let mut replies = Vec::new();
        match res {
            Ok(0) => {
                tracing::debug!(conn = self.id, "connection closed by web server");
                state.failure.get_or_insert(Failure::Eof);
            },
            Ok(n) => {
                crate::macros::trace!(conn = self.id, bytes = n, "read from connection");
                self.ingest(&mut state, &buf[..n], &mut replies);
            },
            Err(e) => {
                tracing::warn!(conn = self.id, error = %e, "reading from connection failed");
                self.fail(&mut state, Failure::Io(e));
            },
        }
        state.read_buf = buf;
        self.readable.notify_all();

        if replies.is_empty() {
            return state;
        }
        // Never wait for the write lock while holding the state lock
        drop(state);
        // Failures are recorded in the state by write_raw
        let _ = self.lock().write_raw(&replies);
        self.state()
    }

    fn fail(&self, state: &mut ConnState, failure: Failure) {
        if state.failure.is_none() {
            state.failure = Some(failure);
        }
        if let Err(e) = self.transport.close() {
            tracing::debug!(conn = self.id, error = %e, "closing failed connection");
        }
    }

    fn ingest(&self, state: &mut ConnState, data: &[u8], replies: &mut Vec<u8>) {
        let ConnState { demux, slots, pending, closing, .. } = &mut *state;
        let res = demux.feed(data, |ev| self.dispatch(ev, slots, pending, closing, replies));
        if let Err(e) = res {
            tracing::warn!(conn = self.id, error = %e, "record stream is unrecoverable");
            self.fail(state, Failure::from_error(e));
        }
    }

    fn dispatch(
        &self,
        ev: Event,
        slots: &mut HashMap<u16, Slot>,
        pending: &mut VecDeque<u16>,
        closing: &mut bool,
        replies: &mut Vec<u8>,
    ) {
        let conn = self.id;
        match ev {
            Event::Begin { request_id, body } => {
                if slots.contains_key(&request_id) {
                    let e = Error::DuplicateRequest(request_id);
                    tracing::warn!(conn, error = %e, "BeginRequest ignored");
                    return;
                }
                let max_reqs = usize::try_from(self.config.max_reqs.get()).unwrap_or(usize::MAX);
                let reject = if !body.role.is_supported() {
                    Some(ExitStatus::UnknownRole)
                } else if !self.config.multiplex && !slots.is_empty() {
                    Some(ExitStatus::CantMpxConn)
                } else if slots.len() >= max_reqs {
                    Some(ExitStatus::Overloaded)
                } else {
                    None
                };

                if let Some(status) = reject {
                    tracing::info!(conn, request_id, role = ?body.role, ?status, "request rejected");
                    replies.extend(fcgi::encode_end_request(request_id, status.to_end_request()));
                    return;
                }
                tracing::debug!(conn, request_id, ?body, "new request received");
                slots.insert(request_id, Slot::new(body));
                pending.push_back(request_id);
            },

            Event::Abort { request_id } => match slots.get_mut(&request_id) {
                Some(slot) if slot.claimed => {
                    tracing::debug!(conn, request_id, "request aborted");
                    slot.aborted = true;
                },
                Some(slot) => {
                    // Nobody works on it yet, so it can be finished right away
                    tracing::debug!(conn, request_id, "request aborted before being served");
                    if !slot.flags.contains(fcgi::RequestFlags::KeepConn) {
                        *closing = true;
                    }
                    slots.remove(&request_id);
                    pending.retain(|&id| id != request_id);
                    replies.extend(fcgi::encode_end_request(request_id, ExitStatus::SUCCESS.to_end_request()));
                },
                None => {
                    let e = Error::UnknownRequest(request_id);
                    tracing::debug!(conn, error = %e, "AbortRequest ignored");
                },
            },

            Event::Stream { request_id, rtype, data } => {
                let Some(slot) = slots.get_mut(&request_id) else {
                    let e = Error::UnknownRequest(request_id);
                    tracing::debug!(conn, error = %e, ?rtype, "stream record ignored");
                    return;
                };
                match rtype {
                    RecordType::Params if !slot.params_done => {
                        if data.is_empty() {
                            slot.params.finish();
                            slot.params_done = true;
                        } else {
                            let Slot { params, env, .. } = slot;
                            params.feed(data, |name, value| {
                                env.push((OwnedVarName::from_utf8_lossy(name), SmallBytes::from_slice(value)));
                            });
                        }
                    },
                    RecordType::Stdin if slot.aborted || slot.over_limit => {
                        crate::macros::trace!(conn, request_id, bytes = data.len(), "STDIN discarded");
                        slot.stdin_done |= data.is_empty();
                    },
                    RecordType::Stdin if !slot.stdin_done => {
                        if data.is_empty() {
                            slot.stdin_done = true;
                            return;
                        }
                        slot.stdin_len += data.len() as u64;
                        match self.config.max_post {
                            Some(max) if slot.stdin_len > max => {
                                tracing::info!(conn, request_id, max_post = max, "request body too large");
                                slot.over_limit = true;
                                slot.stdin = VecDeque::new();
                            },
                            _ => slot.stdin.extend(data),
                        }
                    },
                    _ => {
                        crate::macros::trace!(conn, request_id, ?rtype, "stream record ignored");
                    },
                }
            },

            Event::GetValues(vars) => {
                tracing::debug!(conn, ?vars, "GetValues answered");
                if let Err(e) = vars.write_response(replies, &self.config) {
                    tracing::warn!(conn, error = %e, "failed to encode GetValuesResult");
                }
            },

            Event::UnknownType { request_id, rtype } => {
                tracing::info!(conn, request_id, rtype, "unknown record type ignored");
                replies.extend(fcgi::encode_unknown_type(rtype));
            },

            Event::UnknownRole { request_id, role } => {
                tracing::info!(conn, request_id, role, "unknown role rejected");
                replies.extend(fcgi::encode_end_request(request_id, ExitStatus::UnknownRole.to_end_request()));
            },
        }
    }

    fn claim(self: &Arc<Self>, state: &mut ConnState, filter: impl Fn(&Slot) -> bool) -> Option<Client> {
        let ConnState { slots, pending, .. } = &mut *state;
        let idx = pending.iter().position(|id| slots.get(id).is_some_and(&filter))?;
        let request_id = pending.remove(idx)?;
        let slot = slots.get_mut(&request_id)?;
        slot.claimed = true;
        crate::macros::trace!(conn = self.id, request_id, "request claimed");
        Some(Client {
            conn: Arc::clone(self),
            request_id,
            role: slot.role,
            flags: slot.flags,
            stderr_used: false,
            closed: false,
        })
    }

    /// Waits until `ready` holds for the slot of `request_id`, then applies `f`.
    fn with_slot<T>(
        &self,
        request_id: u16,
        ready: impl Fn(&Slot) -> bool,
        f: impl FnOnce(&mut Slot) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let state = self.state();
        let mut state = self.wait_until(state, |s| {
            s.slots.get(&request_id).map_or(true, |slot| slot.aborted || ready(slot))
        })?;
        match state.slots.get_mut(&request_id) {
            None => Err(Error::UnknownRequest(request_id)),
            Some(slot) if slot.aborted => Err(Error::Aborted),
            Some(slot) => f(slot),
        }
    }

    fn is_aborted(&self, request_id: u16) -> bool {
        self.state().slots.get(&request_id).is_some_and(|s| s.aborted)
    }

    /// Frees the slot of a finished request.
    fn release(&self, request_id: u16, keep_conn: bool) {
        let mut state = self.state();
        state.slots.remove(&request_id);
        state.pending.retain(|&id| id != request_id);
        if !keep_conn {
            state.closing = true;
        }
        if state.closing && state.slots.is_empty() && self.transport.is_open() {
            tracing::debug!(conn = self.id, "closing connection");
            if let Err(e) = self.transport.close() {
                tracing::debug!(conn = self.id, error = %e, "closing connection failed");
            }
        }
        self.readable.notify_all();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}


/// Exclusive write access to a [`Connection`], returned by `Connection::lock`.
#[derive(Debug)]
pub struct WriteGuard<'a> {
    conn: &'a Connection,
    _lock: MutexGuard<'a, ()>,
}

impl WriteGuard<'_> {
    /// Writes already framed records.
    ///
    /// # Errors
    /// Write errors are fatal to the connection. All requests on it fail
    /// their next operation afterwards.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<(), Error> {
        let Err(e) = self.conn.transport.write_all(data) else {
            return Ok(());
        };
        tracing::warn!(conn = self.conn.id, error = %e, "writing to connection failed");
        let err = Error::io_copy(&e);
        let mut state = self.conn.state();
        self.conn.fail(&mut state, Failure::Io(e));
        self.conn.readable.notify_all();
        Err(err)
    }

    /// Writes a prefix of `data` as a single record and returns its length.
    ///
    /// # Errors
    /// See `WriteGuard::write_raw`.
    pub fn write_record(&mut self, rtype: RecordType, request_id: u16, data: &[u8]) -> Result<usize, Error> {
        let mut head = RecordHeader::new(rtype, request_id);
        let len = usize::from(head.set_lengths(data.len()));
        let mut record = Vec::with_capacity(RecordHeader::LEN + head.body_len());
        record.extend_from_slice(&head.to_bytes());
        record.extend_from_slice(&data[..len]);
        record.extend_from_slice(head.padding_bytes());
        self.write_raw(&record)?;
        Ok(len)
    }
}


/// One request's view of a [`Connection`].
///
/// Reads only ever return data of the request's own STDIN stream, and writes
/// are framed as STDOUT or STDERR records of the request.
#[derive(Debug)]
pub struct Client {
    conn: Arc<Connection>,
    request_id: u16,
    role: fcgi::Role,
    flags: fcgi::RequestFlags,
    stderr_used: bool,
    closed: bool,
}

impl Client {
    #[inline]
    #[must_use]
    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    #[inline]
    #[must_use]
    pub fn role(&self) -> fcgi::Role {
        self.role
    }

    /// Tests whether the web server asked to keep the connection open after
    /// this request.
    #[inline]
    #[must_use]
    pub fn keep_connection(&self) -> bool {
        self.flags.contains(fcgi::RequestFlags::KeepConn)
    }

    /// Tests whether the web server aborted the request.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.conn.is_aborted(self.request_id)
    }

    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns the connection the request arrived on.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Waits for the complete PARAMS stream and takes the decoded pairs.
    ///
    /// Later calls return an empty list.
    ///
    /// # Errors
    /// Fails with [`Error::Aborted`] if the request was aborted, and with the
    /// connection's error if it failed before the stream ended.
    pub fn read_params(&mut self) -> Result<Vec<(OwnedVarName, SmallBytes)>, Error> {
        self.conn.with_slot(self.request_id, |s| s.params_done, |s| Ok(std::mem::take(&mut s.env)))
    }

    /// Reads STDIN data of this request into `buf`.
    ///
    /// Returns `Ok(0)` at the end of the stream, and always for roles without
    /// STDIN.
    ///
    /// # Errors
    /// Fails with [`Error::Aborted`] if the request was aborted, and with the
    /// connection's error if it failed before the stream ended. Fails with
    /// [`Error::MaxPostExceeded`] once the stream grew beyond
    /// `Config::max_post`.
    pub fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() || !self.role.has_stdin() {
            return Ok(0);
        }
        let max_post = self.conn.config.max_post;
        self.conn.with_slot(
            self.request_id,
            |s| s.stdin_done || s.over_limit || !s.stdin.is_empty(),
            |s| match max_post {
                Some(max) if s.over_limit => Err(Error::MaxPostExceeded(max)),
                _ => Ok(s.stdin.read(buf)?),
            },
        )
    }

    /// Writes a prefix of `buf` as one STDOUT record, returning its length.
    ///
    /// At most 65528 bytes fit into a record. The caller has to write the
    /// rest separately.
    ///
    /// # Errors
    /// Fails with [`Error::AlreadyClosed`] after `Client::close`. Write errors
    /// are fatal to the connection.
    pub fn write_some(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.write_stream(RecordType::Stdout, buf)
    }

    /// Writes a prefix of `buf` as one STDERR record, returning its length.
    ///
    /// # Errors
    /// See `Client::write_some`.
    pub fn write_stderr(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let n = self.write_stream(RecordType::Stderr, buf)?;
        self.stderr_used |= n > 0;
        Ok(n)
    }

    fn write_stream(&mut self, rtype: RecordType, buf: &[u8]) -> Result<usize, Error> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.conn.lock().write_record(rtype, self.request_id, buf)
    }

    /// Ends the request with `status`.
    ///
    /// Terminates the output streams and sends the EndRequest record. The
    /// connection is closed afterwards unless the web server asked to keep it.
    ///
    /// # Errors
    /// Fails with [`Error::AlreadyClosed`] when called again, without writing
    /// anything. Write errors are forwarded, but the request counts as closed.
    pub fn close(&mut self, status: ExitStatus) -> Result<(), Error> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        self.closed = true;

        let id = self.request_id;
        let mut epilogue = Vec::with_capacity(4 * RecordHeader::LEN);
        epilogue.extend_from_slice(&RecordHeader::new(RecordType::Stdout, id).to_bytes());
        if self.stderr_used {
            epilogue.extend_from_slice(&RecordHeader::new(RecordType::Stderr, id).to_bytes());
        }
        epilogue.extend_from_slice(&fcgi::encode_end_request(id, status.to_end_request()));

        let res = self.conn.lock().write_raw(&epilogue);
        tracing::debug!(conn = self.conn.id, request_id = id, ?status, "request closed");
        self.conn.release(id, self.keep_connection());
        res
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!(conn = self.conn.id, request_id = self.request_id, "request dropped without closing");
            let _ = self.close(ExitStatus::Complete(1));
        }
    }
}


#[cfg(test)]
mod tests {
    use std::num::{NonZeroU32, NonZeroUsize};

    use super::*;
    use crate::protocol::{ProtocolStatus, Role};
    use crate::test_support;
    use crate::transport::MemoryTransport;

    fn config() -> Arc<Config> {
        Arc::new(Config::default())
    }

    fn read_all(client: &mut Client) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        let mut buf = [0; 5];
        loop {
            match client.read_some(&mut buf)? {
                0 => return Ok(out),
                n => out.extend_from_slice(&buf[..n]),
            }
        }
    }

    fn env_value(env: &[(OwnedVarName, SmallBytes)], name: &str) -> Option<Vec<u8>> {
        let name = OwnedVarName::from(name);
        env.iter().find(|(n, _)| *n == name).map(|(_, v)| v.to_vec())
    }

    #[test]
    fn single_request() -> Result<(), Error> {
        let mut input = Vec::new();
        test_support::add_begin(&mut input, 1, Role::Responder, false);
        test_support::add_params(&mut input, 1, &[(b"REQUEST_METHOD", b"POST"), (b"X", b"y")], 5);
        test_support::add_stream(&mut input, 1, RecordType::Stdin, b"hello body", 3);
        test_support::randomize_padding(&mut input);
        let transport = Arc::new(MemoryTransport::with_input(&input));
        let conn = Connection::new(transport.clone(), config());

        let mut client = conn.next_request()?.ok_or(Error::Eof)?;
        assert_eq!((client.request_id(), client.role()), (1, Role::Responder));
        assert!(!client.keep_connection());
        let env = client.read_params()?;
        assert_eq!(env_value(&env, "request_method"), Some(b"POST".to_vec()));
        assert_eq!(env_value(&env, "X"), Some(b"y".to_vec()));
        assert_eq!(read_all(&mut client)?, b"hello body");

        assert_eq!(client.write_some(b"Status: 200 OK\r\n\r\nhi")?, 20);
        assert_eq!(client.write_some(b"")?, 0);
        client.close(ExitStatus::SUCCESS)?;
        assert!(matches!(client.close(ExitStatus::SUCCESS), Err(Error::AlreadyClosed)));
        assert!(matches!(client.write_some(b"late"), Err(Error::AlreadyClosed)));

        let out = transport.take_output();
        assert_eq!(test_support::stream_of(&out, 1, RecordType::Stdout), b"Status: 200 OK\r\n\r\nhi");
        let ends = test_support::end_requests(&out);
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].0, 1);
        assert_eq!(ends[0].1.protocol_status, ProtocolStatus::RequestComplete);
        // STDOUT terminator directly precedes EndRequest
        let records = test_support::parse_records(&out);
        let n = records.len();
        assert_eq!((records[n - 2].0.rtype, records[n - 2].0.content_length), (RecordType::Stdout, 0));

        assert!(!transport.is_open());
        assert!(!conn.is_open());
        assert!(conn.next_request()?.is_none());
        Ok(())
    }

    #[test]
    fn multiplexed_requests_stay_isolated() -> Result<(), Error> {
        let mut input = Vec::new();
        test_support::add_begin(&mut input, 1, Role::Responder, true);
        test_support::add_begin(&mut input, 2, Role::Responder, true);
        test_support::add_params(&mut input, 2, &[(b"QUERY_STRING", b"id=2")], 3);
        test_support::add_params(&mut input, 1, &[(b"QUERY_STRING", b"id=1")], 64);
        let mut first = RecordHeader::new(RecordType::Stdin, 1);
        first.content_length = 4;
        input.extend(first.to_bytes());
        input.extend(b"one-");
        test_support::add_stream(&mut input, 2, RecordType::Stdin, b"two", 1);
        test_support::add_stream(&mut input, 1, RecordType::Stdin, b"body", 2);

        let transport = Arc::new(MemoryTransport::with_input(&input));
        let config = Config::default().with_buffer_size(NonZeroUsize::MIN.saturating_add(6));
        let conn = Connection::new(transport.clone(), Arc::new(config));

        let mut c1 = conn.next_request()?.ok_or(Error::Eof)?;
        let mut c2 = conn.next_request()?.ok_or(Error::Eof)?;
        assert_eq!((c1.request_id(), c2.request_id()), (1, 2));
        assert_eq!(conn.active_requests(), 2);

        // Reading request 2 first forces request 1's data to be buffered
        assert_eq!(env_value(&c2.read_params()?, "QUERY_STRING"), Some(b"id=2".to_vec()));
        assert_eq!(read_all(&mut c2)?, b"two");
        assert_eq!(env_value(&c1.read_params()?, "QUERY_STRING"), Some(b"id=1".to_vec()));
        assert_eq!(read_all(&mut c1)?, b"one-body");

        c2.write_some(b"from 2")?;
        c1.write_some(b"from 1")?;
        c2.close(ExitStatus::Complete(2))?;
        c1.close(ExitStatus::Complete(1))?;
        assert_eq!(conn.active_requests(), 0);
        assert!(conn.is_open());

        let out = transport.take_output();
        assert_eq!(test_support::stream_of(&out, 1, RecordType::Stdout), b"from 1");
        assert_eq!(test_support::stream_of(&out, 2, RecordType::Stdout), b"from 2");
        let ends: Vec<_> = test_support::end_requests(&out).into_iter().map(|(id, e)| (id, e.app_status)).collect();
        assert_eq!(ends, [(2, 2), (1, 1)]);
        Ok(())
    }

    #[test]
    fn concurrent_workers() -> Result<(), Error> {
        let mut input = Vec::new();
        for id in 1..=4 {
            test_support::add_begin(&mut input, id, Role::Responder, true);
        }
        for id in 1..=4 {
            let body = vec![id as u8; 3000];
            test_support::add_params(&mut input, id, &[(b"N", &body[..1])], 8);
            test_support::add_stream(&mut input, id, RecordType::Stdin, &body, 500);
        }
        let transport = Arc::new(MemoryTransport::with_input(&input));
        let conn = Connection::new(transport.clone(), config());

        let clients: Vec<Client> = (0..4).filter_map(|_| conn.next_request().ok().flatten()).collect();
        assert_eq!(clients.len(), 4);
        std::thread::scope(|s| {
            for mut client in clients {
                s.spawn(move || {
                    let id = client.request_id();
                    let body = read_all(&mut client).unwrap();
                    assert_eq!(body, vec![id as u8; 3000]);
                    client.write_some(&body).unwrap();
                    client.close(ExitStatus::SUCCESS).unwrap();
                });
            }
        });

        let out = transport.take_output();
        for id in 1..=4 {
            assert_eq!(test_support::stream_of(&out, id, RecordType::Stdout), vec![id as u8; 3000]);
        }
        assert_eq!(test_support::end_requests(&out).len(), 4);
        Ok(())
    }

    #[test]
    fn management_records() -> Result<(), Error> {
        let mut input = Vec::new();
        test_support::add_get_values(&mut input);
        test_support::add_unknown(&mut input, 0, 0x42);
        let transport = Arc::new(MemoryTransport::with_input(&input));
        let config = Config::with_conns(NonZeroU32::MIN).with_multiplex(false);
        let conn = Connection::new(transport.clone(), Arc::new(config));

        assert!(conn.next_request()?.is_none());
        let out = transport.take_output();
        let records = test_support::parse_records(&out);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0.rtype, RecordType::GetValuesResult);
        let vars: Vec<_> = fcgi::nv::NVIter::new(&records[0].1).collect();
        assert!(vars.contains(&(&b"FCGI_MPXS_CONNS"[..], &b"0"[..])));
        assert_eq!(records[1].0.rtype, RecordType::UnknownType);
        assert_eq!(records[1].1[0], 0x42);
        Ok(())
    }

    #[test]
    fn rejected_requests() -> Result<(), Error> {
        let mut input = Vec::new();
        test_support::add_begin(&mut input, 1, Role::Responder, true);
        test_support::add_begin(&mut input, 2, Role::Responder, true);
        test_support::add_begin(&mut input, 3, Role::Filter, true);
        test_support::add_begin_raw(&mut input, 4, 99, 1);
        // Duplicate of an active request
        test_support::add_begin(&mut input, 1, Role::Authorizer, true);
        let transport = Arc::new(MemoryTransport::with_input(&input));
        let conn = Connection::new(transport.clone(), Arc::new(Config::default().with_multiplex(false)));

        let client = conn.next_request()?.ok_or(Error::Eof)?;
        assert_eq!(client.role(), Role::Responder);
        assert!(conn.next_request()?.is_none());

        let ends: Vec<_> = test_support::end_requests(&transport.take_output())
            .into_iter()
            .map(|(id, e)| (id, e.protocol_status))
            .collect();
        assert_eq!(ends, [
            (2, ProtocolStatus::CantMpxConn),
            (3, ProtocolStatus::UnknownRole),
            (4, ProtocolStatus::UnknownRole),
        ]);
        assert_eq!(conn.active_requests(), 1);
        Ok(())
    }

    #[test]
    fn overload_and_unknown_role() -> Result<(), Error> {
        let mut input = Vec::new();
        test_support::add_begin(&mut input, 1, Role::Responder, true);
        test_support::add_begin(&mut input, 2, Role::Filter, true);
        test_support::add_begin(&mut input, 3, Role::Responder, true);
        let transport = Arc::new(MemoryTransport::with_input(&input));
        let config = Config::default().with_max_reqs(NonZeroU32::MIN);
        let conn = Connection::new(transport.clone(), Arc::new(config));

        let _client = conn.next_request()?.ok_or(Error::Eof)?;
        assert!(conn.next_request()?.is_none());
        let ends: Vec<_> = test_support::end_requests(&transport.take_output())
            .into_iter()
            .map(|(id, e)| (id, e.protocol_status))
            .collect();
        assert_eq!(ends, [(2, ProtocolStatus::UnknownRole), (3, ProtocolStatus::Overloaded)]);
        Ok(())
    }

    #[test]
    fn aborts() -> Result<(), Error> {
        let mut input = Vec::new();
        test_support::add_begin(&mut input, 1, Role::Responder, true);
        test_support::add_begin(&mut input, 2, Role::Responder, true);
        test_support::add_params(&mut input, 1, &[], 8);
        let transport = Arc::new(MemoryTransport::with_input(&input));
        let conn = Connection::new(transport.clone(), config());

        let mut c1 = conn.next_request()?.ok_or(Error::Eof)?;
        assert!(c1.read_params()?.is_empty());
        let mut abort = Vec::new();
        test_support::add_abort(&mut abort, 1);
        test_support::add_abort(&mut abort, 2);
        test_support::add_stream(&mut abort, 1, RecordType::Stdin, b"ignored", 7);
        transport.push_input(&abort);

        assert!(matches!(c1.read_some(&mut [0; 8]), Err(Error::Aborted)));
        assert!(c1.is_aborted());
        // Request 2 was never claimed and is finished by the connection
        assert!(conn.next_request()?.is_none());
        c1.close(ExitStatus::Complete(3))?;

        let ends: Vec<_> = test_support::end_requests(&transport.take_output())
            .into_iter()
            .map(|(id, e)| (id, e.app_status))
            .collect();
        assert_eq!(ends, [(2, 0), (1, 3)]);
        Ok(())
    }

    #[test]
    fn body_limit_applies_while_buffering() -> Result<(), Error> {
        let mut head = Vec::new();
        test_support::add_begin(&mut head, 1, Role::Responder, true);
        test_support::add_begin(&mut head, 2, Role::Responder, true);
        test_support::add_params(&mut head, 1, &[(b"REQUEST_METHOD", b"POST")], 8);
        test_support::add_params(&mut head, 2, &[(b"REQUEST_METHOD", b"POST")], 8);
        let mut body = Vec::new();
        test_support::add_stream(&mut body, 1, RecordType::Stdin, &vec![b'x'; 1_000_000], 32_768);
        let mut late = Vec::new();
        test_support::add_abort(&mut late, 2);
        test_support::add_stream(&mut late, 2, RecordType::Stdin, b"after abort", 4);

        let transport = Arc::new(MemoryTransport::new());
        let conn = Connection::fed(transport.clone(), Arc::new(Config::default().with_max_post(Some(16))));
        conn.feed(&head)?;
        let mut c1 = conn.try_claim().ok_or(Error::Eof)?;
        let mut c2 = conn.try_claim().ok_or(Error::Eof)?;
        assert_eq!(c2.read_params()?.len(), 1);

        // Everything but the stream terminator
        conn.feed(&body[..body.len() - RecordHeader::LEN])?;
        conn.feed(&late)?;
        {
            let state = conn.state();
            let slot = &state.slots[&1];
            assert!(slot.over_limit && slot.is_loaded());
            assert!(slot.stdin.is_empty());
            assert!(state.slots[&2].stdin.is_empty());
        }
        assert_eq!(c1.read_params()?.len(), 1);
        assert!(matches!(c1.read_some(&mut [0; 8]), Err(Error::MaxPostExceeded(16))));
        assert!(matches!(c2.read_some(&mut [0; 8]), Err(Error::Aborted)));

        conn.feed(&body[body.len() - RecordHeader::LEN..])?;
        assert!(matches!(c1.read_some(&mut [0; 8]), Err(Error::MaxPostExceeded(16))));
        c1.close(ExitStatus::Complete(1))?;
        c2.close(ExitStatus::Complete(1))?;
        assert_eq!(test_support::end_requests(&transport.take_output()).len(), 2);
        Ok(())
    }

    #[test]
    fn large_writes_are_split() -> Result<(), Error> {
        let mut input = Vec::new();
        test_support::add_begin(&mut input, 7, Role::Authorizer, true);
        test_support::add_params(&mut input, 7, &[(b"A", b"b")], 8);
        let transport = Arc::new(MemoryTransport::with_input(&input));
        let conn = Connection::new(transport.clone(), config());

        let mut client = conn.next_request()?.ok_or(Error::Eof)?;
        // Authorizers have no STDIN
        assert_eq!(client.read_some(&mut [0; 4])?, 0);
        let data = vec![b'x'; 70_000];
        let first = client.write_some(&data)?;
        assert_eq!(first, 65528);
        assert_eq!(client.write_some(&data[first..])?, 70_000 - 65528);
        assert_eq!(client.write_stderr(b"warning")?, 7);
        client.close(ExitStatus::SUCCESS)?;

        let out = transport.take_output();
        let records = test_support::parse_records(&out);
        let kinds: Vec<_> = records.iter().map(|(h, _)| (h.rtype, h.content_length)).collect();
        assert_eq!(kinds, [
            (RecordType::Stdout, 65528),
            (RecordType::Stdout, 4472),
            (RecordType::Stderr, 7),
            (RecordType::Stdout, 0),
            (RecordType::Stderr, 0),
            (RecordType::EndRequest, 8),
        ]);
        assert!(records.iter().all(|(h, _)| h.content_length % 8 == 0 || h.padding_length > 0));
        Ok(())
    }

    #[test]
    fn malformed_header_fails_everyone() -> Result<(), Error> {
        let mut input = Vec::new();
        test_support::add_begin(&mut input, 1, Role::Responder, true);
        input.extend([9, 4, 0, 1, 0, 0, 0, 0]);
        let transport = Arc::new(MemoryTransport::with_input(&input));
        let conn = Connection::new(transport.clone(), config());

        let mut client = conn.next_request()?.ok_or(Error::Eof)?;
        assert!(matches!(client.read_params(), Err(Error::MalformedHeader(fcgi::Error::UnknownVersion(9)))));
        assert!(!conn.is_open());
        assert!(matches!(conn.next_request(), Err(Error::MalformedHeader(_))));
        Ok(())
    }

    #[test]
    fn fed_connection() -> Result<(), Error> {
        let mut input = Vec::new();
        test_support::add_begin(&mut input, 1, Role::Responder, false);
        test_support::add_params(&mut input, 1, &[(b"A", b"1")], 8);
        let split = input.len();
        test_support::add_stream(&mut input, 1, RecordType::Stdin, b"data", 8);

        let transport = Arc::new(MemoryTransport::new());
        let conn = Connection::fed(transport.clone(), config());
        conn.feed(&input[..split])?;
        assert!(conn.claim_loaded().is_none());
        let mut client = conn.try_claim().ok_or(Error::Eof)?;
        assert_eq!(client.read_params()?.len(), 1);
        let err = client.read_some(&mut [0; 4]).map_err(io::Error::from);
        assert_eq!(err.map_err(|e| e.kind()), Err(io::ErrorKind::WouldBlock));

        conn.feed(&input[split..])?;
        assert!(conn.claim_loaded().is_none());
        assert_eq!(read_all(&mut client)?, b"data");
        client.close(ExitStatus::SUCCESS)?;
        conn.feed_eof();
        assert!(!conn.is_open());
        assert_eq!(test_support::end_requests(&transport.take_output()).len(), 1);
        Ok(())
    }
}
