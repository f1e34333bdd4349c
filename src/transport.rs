//! A [`Transport`] is a duplex byte stream carrying FastCGI records. All of
//! its methods take `&self`, since one thread may be blocked reading from a
//! connection while another writes a response to it. A [`Listener`] produces
//! new transports for the [`Acceptor`](crate::Acceptor).

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};


/// A duplex byte stream to a web server.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Reads at least one byte into `buf`, blocking if necessary.
    ///
    /// Returns `Ok(0)` once the peer has closed its side or the transport was
    /// closed locally.
    ///
    /// # Errors
    /// I/O errors are fatal to the connection using the transport.
    fn read_some(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes a prefix of `buf`, returning its length.
    ///
    /// # Errors
    /// Fails with [`io::ErrorKind::NotConnected`] after `Transport::close`.
    /// Other I/O errors are fatal to the connection using the transport.
    fn write_some(&self, buf: &[u8]) -> io::Result<usize>;

    /// Tests whether `Transport::close` has not been called yet.
    fn is_open(&self) -> bool;

    /// Closes the transport. Blocked readers are woken up if possible.
    /// Closing an already closed transport does nothing.
    ///
    /// # Errors
    /// I/O errors during shutdown are forwarded.
    fn close(&self) -> io::Result<()>;

    /// Writes all of `buf` by calling `Transport::write_some` repeatedly.
    ///
    /// # Errors
    /// Fails with [`io::ErrorKind::WriteZero`] if the transport stops
    /// accepting data. Errors from `Transport::write_some` are forwarded,
    /// except for [`io::ErrorKind::Interrupted`].
    fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write_some(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    #[inline]
    fn read_some(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_some(buf)
    }

    #[inline]
    fn write_some(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).write_some(buf)
    }

    #[inline]
    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    #[inline]
    fn close(&self) -> io::Result<()> {
        (**self).close()
    }
}


/// A connected stream socket usable by a [`StreamTransport`].
pub trait Socket: Send + Sync + fmt::Debug {
    /// Shuts down both directions of the socket.
    ///
    /// # Errors
    /// Errors from the operating system are forwarded.
    fn shutdown_both(&self) -> io::Result<()>;
}

impl Socket for TcpStream {
    #[inline]
    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

#[cfg(unix)]
impl Socket for UnixStream {
    #[inline]
    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// A [`Transport`] over a connected TCP or Unix domain socket.
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
    open: AtomicBool,
}

impl<S> StreamTransport<S> {
    /// Wraps a connected socket.
    #[inline]
    #[must_use]
    pub fn new(stream: S) -> Self {
        Self { stream, open: AtomicBool::new(true) }
    }

    /// Returns a reference to the underlying socket.
    #[inline]
    #[must_use]
    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

impl<S: Socket> Transport for StreamTransport<S>
where
    for<'a> &'a S: Read + Write,
{
    fn read_some(&self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.is_open() {
            return Ok(0);
        }
        (&self.stream).read(buf)
    }

    fn write_some(&self, buf: &[u8]) -> io::Result<usize> {
        if !self.is_open() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        (&self.stream).write(buf)
    }

    #[inline]
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) -> io::Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        match self.stream.shutdown_both() {
            // The peer may have closed the socket first
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            res => res,
        }
    }
}


/// A [`Transport`] over separate read and write halves, such as a pair of
/// anonymous pipes or the standard streams of the process.
pub struct PipeTransport<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    open: AtomicBool,
}

impl<R, W> PipeTransport<R, W> {
    /// Combines a reader and a writer into a transport.
    #[must_use]
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader: Mutex::new(reader), writer: Mutex::new(writer), open: AtomicBool::new(true) }
    }
}

impl PipeTransport<io::Stdin, io::Stdout> {
    /// Creates a transport reading from stdin and writing to stdout.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(io::stdin(), io::stdout())
    }
}

impl<R, W> fmt::Debug for PipeTransport<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PipeTransport").field("open", &self.is_open_inner()).finish_non_exhaustive()
    }
}

impl<R, W> PipeTransport<R, W> {
    #[inline]
    fn is_open_inner(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl<R: Read + Send, W: Write + Send> Transport for PipeTransport<R, W> {
    fn read_some(&self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.is_open_inner() {
            return Ok(0);
        }
        self.reader.lock().unwrap_or_else(PoisonError::into_inner).read(buf)
    }

    fn write_some(&self, buf: &[u8]) -> io::Result<usize> {
        if !self.is_open_inner() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let mut w = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let n = w.write(buf)?;
        // Records must not linger in a userspace buffer such as Stdout's
        w.flush()?;
        Ok(n)
    }

    #[inline]
    fn is_open(&self) -> bool {
        self.is_open_inner()
    }

    fn close(&self) -> io::Result<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            self.writer.lock().unwrap_or_else(PoisonError::into_inner).flush()?;
        }
        Ok(())
    }
}


/// An in-memory [`Transport`].
///
/// Input is queued with `MemoryTransport::push_input` and output collected
/// with `MemoryTransport::take_output`. Reading from an empty input queue
/// returns `Ok(0)`, just like a closed socket.
#[derive(Debug)]
pub struct MemoryTransport {
    inbound: Mutex<VecDeque<u8>>,
    outbound: Mutex<Vec<u8>>,
    open: AtomicBool,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self {
            inbound: Mutex::default(),
            outbound: Mutex::default(),
            open: AtomicBool::new(true),
        }
    }
}

impl MemoryTransport {
    /// Creates an open transport without any input.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an open transport with `input` queued.
    #[must_use]
    pub fn with_input(input: &[u8]) -> Self {
        let this = Self::new();
        this.push_input(input);
        this
    }

    /// Appends `data` to the input queue.
    pub fn push_input(&self, data: &[u8]) {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner).extend(data);
    }

    /// Removes and returns everything written so far.
    #[must_use]
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut *self.outbound.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Returns the number of written bytes not yet taken.
    #[must_use]
    pub fn output_len(&self) -> usize {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Transport for MemoryTransport {
    fn read_some(&self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.is_open() {
            return Ok(0);
        }
        let mut inbound = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        let n = buf.len().min(inbound.len());
        for (dst, src) in buf.iter_mut().zip(inbound.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write_some(&self, buf: &[u8]) -> io::Result<usize> {
        if !self.is_open() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner).extend_from_slice(buf);
        Ok(buf.len())
    }

    #[inline]
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    #[inline]
    fn close(&self) -> io::Result<()> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }
}


/// A source of new [`Transport`]s.
pub trait Listener: Send + Sync {
    /// Waits for the next connection.
    ///
    /// Returns `Ok(None)` once the listener is exhausted and will never
    /// produce another connection.
    ///
    /// # Errors
    /// I/O errors from the operating system are forwarded. The listener may
    /// still be usable afterwards.
    fn accept(&self) -> io::Result<Option<Arc<dyn Transport>>>;
}

impl Listener for TcpListener {
    fn accept(&self) -> io::Result<Option<Arc<dyn Transport>>> {
        let (stream, peer) = TcpListener::accept(self)?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "failed to set TCP_NODELAY");
        }
        tracing::debug!(%peer, "accepted TCP connection");
        Ok(Some(Arc::new(StreamTransport::new(stream))))
    }
}

#[cfg(unix)]
impl Listener for UnixListener {
    fn accept(&self) -> io::Result<Option<Arc<dyn Transport>>> {
        let (stream, _) = UnixListener::accept(self)?;
        tracing::debug!("accepted Unix domain connection");
        Ok(Some(Arc::new(StreamTransport::new(stream))))
    }
}

/// Takes over the listening socket a web server passes to the FastCGI
/// applications it spawns, found at
/// [`FCGI_LISTENSOCK_FILENO`](crate::protocol::FCGI_LISTENSOCK_FILENO).
///
/// # Errors
/// Fails if the file descriptor cannot be duplicated or is not a socket,
/// which usually means that the application was not started by a web server.
#[cfg(unix)]
pub fn from_listensock() -> io::Result<UnixListener> {
    use std::os::fd::AsFd;
    // Stdin is FCGI_LISTENSOCK_FILENO
    let fd = io::stdin().as_fd().try_clone_to_owned()?;
    let listener = UnixListener::from(fd);
    listener.local_addr()?;
    Ok(listener)
}


/// A [`Listener`] yielding a single transport.
///
/// This is how an application serves a web server that talks to it over
/// its standard streams.
pub struct OnceListener(Mutex<Option<Arc<dyn Transport>>>);

impl OnceListener {
    /// Creates a listener yielding `transport` once.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self(Mutex::new(Some(transport)))
    }

    /// Creates a listener yielding a transport over stdin and stdout.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(Arc::new(PipeTransport::stdio()))
    }
}

impl Listener for OnceListener {
    fn accept(&self) -> io::Result<Option<Arc<dyn Transport>>> {
        Ok(self.0.lock().unwrap_or_else(PoisonError::into_inner).take())
    }
}

impl fmt::Debug for OnceListener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let pending = self.0.lock().unwrap_or_else(PoisonError::into_inner).is_some();
        f.debug_struct("OnceListener").field("pending", &pending).finish()
    }
}


/// A [`Listener`] yielding queued [`MemoryTransport`]s.
#[derive(Debug, Default)]
pub struct MemoryListener(Mutex<VecDeque<Arc<MemoryTransport>>>);

impl MemoryListener {
    /// Creates an empty listener.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a transport, returned by a later `Listener::accept`.
    pub fn push(&self, transport: Arc<MemoryTransport>) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push_back(transport);
    }
}

impl FromIterator<Arc<MemoryTransport>> for MemoryListener {
    fn from_iter<T: IntoIterator<Item = Arc<MemoryTransport>>>(iter: T) -> Self {
        Self(Mutex::new(iter.into_iter().collect()))
    }
}

impl Listener for MemoryListener {
    fn accept(&self) -> io::Result<Option<Arc<dyn Transport>>> {
        let next = self.0.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        Ok(next.map(|t| t as Arc<dyn Transport>))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_transport() -> io::Result<()> {
        let t = MemoryTransport::with_input(b"hello");
        let mut buf = [0; 3];
        assert_eq!(t.read_some(&mut buf)?, 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(t.read_some(&mut buf)?, 2);
        assert_eq!(t.read_some(&mut buf)?, 0);

        t.write_all(b"out")?;
        assert_eq!(t.output_len(), 3);
        assert_eq!(t.take_output(), b"out");
        assert_eq!(t.output_len(), 0);

        t.close()?;
        assert!(!t.is_open());
        assert_eq!(t.write_some(b"x").map_err(|e| e.kind()), Err(io::ErrorKind::NotConnected));
        Ok(())
    }

    #[test]
    fn pipe_transport() -> io::Result<()> {
        let t = PipeTransport::new(&b"input"[..], Vec::new());
        let mut buf = [0; 8];
        assert_eq!(t.read_some(&mut buf)?, 5);
        t.write_all(b"output")?;
        t.close()?;
        assert_eq!(t.read_some(&mut buf)?, 0);
        let PipeTransport { writer, .. } = t;
        assert_eq!(writer.into_inner().unwrap_or_else(PoisonError::into_inner), b"output");
        Ok(())
    }

    #[test]
    fn tcp_transport() -> io::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let client = TcpStream::connect(listener.local_addr()?)?;
        let server = Listener::accept(&listener)?.ok_or(io::ErrorKind::NotConnected)?;

        (&client).write_all(b"ping")?;
        let mut buf = [0; 4];
        let mut read = 0;
        while read < 4 {
            read += server.read_some(&mut buf[read..])?;
        }
        assert_eq!(&buf, b"ping");

        server.close()?;
        assert!(!server.is_open());
        let mut rest = Vec::new();
        (&client).read_to_end(&mut rest)?;
        assert!(rest.is_empty());
        Ok(())
    }

    #[test]
    fn once_and_memory_listeners() -> io::Result<()> {
        let once = OnceListener::new(Arc::new(MemoryTransport::new()));
        assert!(once.accept()?.is_some());
        assert!(once.accept()?.is_none());

        let mem = MemoryListener::new();
        mem.push(Arc::new(MemoryTransport::with_input(b"a")));
        mem.push(Arc::new(MemoryTransport::new()));
        assert!(mem.accept()?.is_some());
        assert!(mem.accept()?.is_some());
        assert!(mem.accept()?.is_none());
        Ok(())
    }
}
