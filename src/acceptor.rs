use std::io;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::{Client, Config, Connection, Error, ExitStatus, Lifecycle, Listener, Request};


/// A request handler for the blocking [`Acceptor`].
///
/// Implemented for all `FnMut(&mut Request) -> io::Result<ExitStatus>`
/// closures. A handler may close the request itself, for example with
/// [`commit`](crate::commit). Otherwise the request is closed with the
/// returned status. Errors and panics end the request with a
/// `500 Internal Server Error` if no output was written yet.
pub trait Handler {
    /// Handles a single accepted request.
    ///
    /// # Errors
    /// Errors are logged and end the request with a failure status.
    fn handle(&mut self, req: &mut Request) -> io::Result<ExitStatus>;
}

impl<F> Handler for F
where
    F: FnMut(&mut Request) -> io::Result<ExitStatus>,
{
    #[inline]
    fn handle(&mut self, req: &mut Request) -> io::Result<ExitStatus> {
        self(req)
    }
}


#[derive(Debug, Default)]
struct Pool {
    /// Cleared requests ready for reuse.
    free: Vec<Request>,
    running: usize,
    /// Connections which may hold pending multiplexed requests.
    conns: Vec<Weak<Connection>>,
}

/// Accepts requests from a [`Listener`] and runs them through a handler.
///
/// The acceptor keeps a free list of [`Request`] objects, so their buffers
/// are reused across requests. It can be shared by any number of worker
/// threads, each calling `Acceptor::accept` or `Acceptor::run` in a loop.
/// Requests are taken from the following sources, in order:
/// 1. A request which already began on a known connection.
/// 2. The next request on the connection kept open by the previous request.
/// 3. The first request on a newly accepted connection.
#[derive(Debug)]
pub struct Acceptor<L> {
    listener: L,
    config: Arc<Config>,
    pool: Mutex<Pool>,
}

impl<L: Listener> Acceptor<L> {
    /// Creates an acceptor for connections from `listener`.
    #[must_use]
    pub fn new(listener: L, config: Config) -> Self {
        Self { listener, config: Arc::new(config), pool: Mutex::default() }
    }

    /// Returns the configuration shared with all connections.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Returns the number of requests currently being handled.
    #[must_use]
    pub fn running(&self) -> usize {
        self.pool().running
    }

    /// Returns the number of cleared requests waiting for reuse.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.pool().free.len()
    }

    fn pool(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for the next request and handles it.
    ///
    /// Returns `Ok(false)` once the listener is exhausted.
    ///
    /// # Errors
    /// Fails if the listener fails. Errors of individual connections are
    /// logged and do not surface here.
    pub fn accept<H: Handler + ?Sized>(&self, handler: &mut H) -> Result<bool, Error> {
        let mut req = {
            let mut pool = self.pool();
            pool.running += 1;
            pool.free.pop()
        }
        .unwrap_or_else(|| Request::new(Arc::clone(&self.config)));

        let res = self.serve_next(&mut req, handler);
        let mut pool = self.pool();
        pool.running -= 1;
        pool.free.push(req);
        res
    }

    fn serve_next<H: Handler + ?Sized>(&self, req: &mut Request, handler: &mut H) -> Result<bool, Error> {
        let Some(client) = self.next_client(req)? else {
            tracing::info!("listener exhausted");
            return Ok(false);
        };
        let conn = client.connection().id();
        req.accept(client)?;

        let span = tracing::error_span!("fastcgi_request", conn, request_id = req.id());
        let _enter = span.enter();
        tracing::debug!(role = ?req.role(), keep_conn = req.keep_connection(), "request accepted");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(req)));
        finish_request(req, outcome);
        req.clear();
        Ok(true)
    }

    fn next_client(&self, req: &mut Request) -> Result<Option<Client>, Error> {
        if let Some(client) = self.claim_pending() {
            return Ok(Some(client));
        }

        if let Some(conn) = req.take_connection().filter(|c| c.is_open()) {
            match conn.next_request() {
                Ok(Some(client)) => return Ok(Some(client)),
                Ok(None) => tracing::debug!(conn = conn.id(), "kept connection closed"),
                Err(e) => {
                    let error: &dyn std::error::Error = &e;
                    tracing::info!(conn = conn.id(), error, "kept connection failed");
                },
            }
        }

        loop {
            let Some(transport) = self.listener.accept()? else {
                return Ok(None);
            };
            let conn = Connection::new(transport, Arc::clone(&self.config));
            self.pool().conns.push(Arc::downgrade(&conn));
            match conn.next_request() {
                Ok(Some(client)) => return Ok(Some(client)),
                Ok(None) => tracing::debug!(conn = conn.id(), "connection closed without a request"),
                Err(e) => {
                    let error: &dyn std::error::Error = &e;
                    tracing::info!(conn = conn.id(), error, "connection failed before its first request");
                },
            }
        }
    }

    /// Claims a request which already began on a known connection.
    fn claim_pending(&self) -> Option<Client> {
        let mut pool = self.pool();
        pool.conns.retain(|w| w.upgrade().is_some_and(|c| c.is_open() || c.active_requests() > 0));
        pool.conns.iter().filter_map(Weak::upgrade).find_map(|c| c.try_claim())
    }

    /// Handles requests until the listener is exhausted.
    ///
    /// # Errors
    /// Fails if the listener fails.
    pub fn run<H: Handler + ?Sized>(&self, handler: &mut H) -> Result<(), Error> {
        while self.accept(handler)? {}
        Ok(())
    }

    /// Runs `workers` threads which handle requests until the listener is
    /// exhausted. Each thread uses its own clone of `handler`.
    ///
    /// # Errors
    /// Fails if a thread cannot be spawned, or with the first error of a
    /// worker's `Acceptor::run`. The other workers keep running until the
    /// listener is exhausted.
    pub fn run_workers<H>(&self, workers: NonZeroUsize, handler: H) -> Result<(), Error>
    where
        H: Handler + Clone + Send,
    {
        std::thread::scope(|s| {
            let handles = (0..workers.get())
                .map(|i| {
                    let mut handler = handler.clone();
                    std::thread::Builder::new()
                        .name(format!("fastcgi-worker-{i}"))
                        .spawn_scoped(s, move || self.run(&mut handler))
                })
                .collect::<Result<Vec<_>, io::Error>>()?;

            let mut res = Ok(());
            for h in handles {
                let r = h.join().unwrap_or(Err(Error::Paniced));
                if let Err(e) = &r {
                    tracing::error!(error = %e, "worker stopped");
                }
                res = res.and(r);
            }
            res
        })
    }
}


const INTERNAL_ERROR: &[u8] =
    b"Status: 500 Internal Server Error\r\nContent-Type: text/plain\r\n\r\nInternal Server Error\n";

/// Closes `req` according to the handler's `outcome`, unless the handler
/// closed it already.
pub(crate) fn finish_request(req: &mut Request, outcome: std::thread::Result<io::Result<ExitStatus>>) {
    let (http_status, status) = match outcome {
        Ok(Ok(status)) => (req.http_status(), status),
        Ok(Err(e)) => {
            let error: &dyn std::error::Error = &e;
            tracing::error!(error, "request handler failed");
            (500, ExitStatus::Complete(1))
        },
        Err(_) => {
            tracing::error!("request handler panicked");
            (500, ExitStatus::Complete(1))
        },
    };

    if matches!(req.lifecycle(), Lifecycle::Closed | Lifecycle::Unaccepted) {
        return;
    }
    if http_status == 500 && req.is_open() && req.bytes_written() == 0 {
        if let Err(e) = req.write_stdout_all(INTERNAL_ERROR) {
            tracing::debug!(error = %e, "error response not sent");
        }
    }
    if let Err(e) = req.close(http_status, status) {
        tracing::debug!(error = %e, "closing request failed");
    }
}
