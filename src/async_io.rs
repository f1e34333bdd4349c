//! Connections are driven by [`serve`], which reads records from any
//! [`AsyncRead`], dispatches every request once its input was received
//! completely and writes the responses to an [`AsyncWrite`]. Handlers get the
//! same [`Request`] as the blocking [`Acceptor`](crate::Acceptor), with all
//! input already buffered, so loading it never blocks the executor.
//!
//! A [`Runner`] limits the number of concurrent connections to
//! `Config::max_conns` and waits for running connections at shutdown.

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_lock::{Semaphore, SemaphoreGuardArc};
use futures_util::future::BoxFuture;
use futures_util::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures_util::FutureExt;

use crate::acceptor::finish_request;
use crate::transport::MemoryTransport;
use crate::{Config, Connection, Error, ExitStatus, Request};

mod util;
use util::{TaskGroup, TaskToken};


/// Limits and tracks the connections of an `async` application.
#[derive(Debug)]
pub struct Runner {
    config: Arc<Config>,
    permits: Arc<Semaphore>,
    tasks: TaskGroup,
}

impl Config {
    /// Creates a [`Runner`] for this configuration.
    #[must_use]
    pub fn async_runner(self) -> Runner {
        Runner::new(self)
    }
}

impl Runner {
    /// Creates a runner admitting `config.max_conns` concurrent connections.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let permits = usize::try_from(config.max_conns.get()).unwrap_or(usize::MAX);
        Self { config: Arc::new(config), permits: Arc::new(Semaphore::new(permits)), tasks: TaskGroup::default() }
    }

    /// Returns the configuration shared with all connections.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Returns the number of connection tokens alive.
    #[inline]
    #[must_use]
    pub fn active(&self) -> usize {
        self.tasks.active()
    }

    /// Waits until another connection may be served.
    ///
    /// The token should be obtained before accepting the connection and kept
    /// alive while serving it, usually by calling `ConnToken::run`.
    pub async fn get_token(&mut self) -> ConnToken {
        let permit = self.permits.acquire_arc().await;
        ConnToken { config: Arc::clone(&self.config), _permit: permit, _task: self.tasks.token() }
    }

    /// Waits until every token handed out by this runner was dropped.
    pub async fn shutdown(self) {
        let active = self.tasks.active();
        if active > 0 {
            tracing::info!(active, "waiting for connections to finish");
        }
        self.tasks.await;
    }
}


/// Permission to serve one connection, obtained from `Runner::get_token`.
#[derive(Debug)]
#[must_use = "the connection slot is released once the token is dropped"]
pub struct ConnToken {
    config: Arc<Config>,
    _permit: SemaphoreGuardArc,
    _task: TaskToken,
}

impl ConnToken {
    /// Serves a connection with [`serve`], then releases the token.
    ///
    /// # Errors
    /// See [`serve`].
    pub async fn run<R, W, H>(self, reader: R, writer: W, handler: H) -> Result<(), Error>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
        H: for<'r> FnMut(&'r mut Request) -> BoxFuture<'r, io::Result<ExitStatus>>,
    {
        let res = serve(reader, writer, Arc::clone(&self.config), handler).await;
        if let Err(e) = &res {
            tracing::info!(error = %e, "connection ended with an error");
        }
        res
    }
}


/// Serves all requests of one connection.
///
/// Requests are handled one at a time, in the order their input was
/// completed. The handler's future has to be boxed, for example with
/// [`FutureExt::boxed`]. It may close the request itself. Otherwise the
/// request is closed with the returned status, like with the blocking
/// [`Handler`](crate::Handler).
///
/// Returns once the web server closed the connection, or after a request
/// without `KeepConn` was finished.
///
/// # Errors
/// Fails if reading or writing fails, or if a record header cannot be
/// decoded. Output produced up to that point is still written out.
pub async fn serve<R, W, H>(mut reader: R, mut writer: W, config: Arc<Config>, mut handler: H) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    H: for<'r> FnMut(&'r mut Request) -> BoxFuture<'r, io::Result<ExitStatus>>,
{
    let transport = Arc::new(MemoryTransport::new());
    let conn = Connection::fed(transport.clone(), Arc::clone(&config));
    let mut req = Request::new(Arc::clone(&config));
    let mut buf = vec![0; config.buffer_size.get()];

    loop {
        while let Some(client) = conn.claim_loaded() {
            req.accept(client)?;
            let span = tracing::error_span!("fastcgi_request", conn = conn.id(), request_id = req.id());
            span.in_scope(|| tracing::debug!(role = ?req.role(), "request received"));

            let outcome = AssertUnwindSafe(handler(&mut req)).catch_unwind().await;
            span.in_scope(|| finish_request(&mut req, outcome));
            req.clear();
            flush(&transport, &mut writer).await?;
        }
        flush(&transport, &mut writer).await?;
        if !conn.is_open() {
            break;
        }

        let n = reader.read(&mut buf).await?;
        if n == 0 {
            tracing::debug!(conn = conn.id(), pending = conn.active_requests(), "connection closed by the web server");
            conn.feed_eof();
            break;
        }
        if let Err(e) = conn.feed(&buf[..n]) {
            flush(&transport, &mut writer).await?;
            return Err(e);
        }
    }
    writer.close().await?;
    Ok(())
}

async fn flush<W: AsyncWrite + Unpin>(transport: &MemoryTransport, writer: &mut W) -> io::Result<()> {
    let out = transport.take_output();
    if !out.is_empty() {
        crate::macros::trace!(bytes = out.len(), "flushing output");
        writer.write_all(&out).await?;
        writer.flush().await?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use std::num::{NonZeroU32, NonZeroUsize};

    use futures_util::io::Cursor;

    use super::*;
    use crate::protocol::{RecordType, Role};
    use crate::{commit, test_support, LoadTargets, Response};

    async fn echo(req: &mut Request) -> io::Result<ExitStatus> {
        req.load(LoadTargets::ALL)?;
        let mut resp = Response::new();
        resp.set_header("Content-Type", "text/plain")?;
        let greeting = format!("{} {}", req.request_method().unwrap_or("?"), req.post().get("msg").unwrap_or("-"));
        io::Write::write_all(&mut resp, greeting.as_bytes())?;
        commit(req, &mut resp, 0)?;
        Ok(ExitStatus::SUCCESS)
    }

    fn requests() -> Vec<u8> {
        let mut input = Vec::new();
        test_support::add_begin(&mut input, 1, Role::Responder, true);
        test_support::add_begin(&mut input, 2, Role::Responder, true);
        test_support::add_params(&mut input, 2, &[(b"REQUEST_METHOD", b"GET")], 3);
        test_support::add_stream(&mut input, 2, RecordType::Stdin, b"", 1);
        let params: &[(&[u8], &[u8])] = &[
            (b"REQUEST_METHOD", b"POST"),
            (b"CONTENT_TYPE", b"application/x-www-form-urlencoded"),
        ];
        test_support::add_params(&mut input, 1, params, 5);
        test_support::add_stream(&mut input, 1, RecordType::Stdin, b"msg=hi+there", 4);
        test_support::add_get_values(&mut input);
        test_support::randomize_padding(&mut input);
        input
    }

    #[tokio::test]
    async fn serves_multiplexed_requests() -> Result<(), Error> {
        let mut out = Vec::new();
        // Small reads let request 2 complete before request 1
        let config = Arc::new(Config::default().with_buffer_size(NonZeroUsize::new(16).unwrap()));
        serve(Cursor::new(requests()), &mut out, config, |r| echo(r).boxed()).await?;

        assert!(test_support::stream_of(&out, 1, RecordType::Stdout).ends_with(b"POST hi there"));
        assert!(test_support::stream_of(&out, 2, RecordType::Stdout).ends_with(b"GET -"));
        let ends: Vec<_> = test_support::end_requests(&out).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ends, [2, 1]);
        let records = test_support::parse_records(&out);
        assert!(records.iter().any(|(h, _)| h.rtype == RecordType::GetValuesResult));
        Ok(())
    }

    #[tokio::test]
    async fn stops_after_last_request() -> Result<(), Error> {
        let params: &[(&[u8], &[u8])] = &[(b"REQUEST_METHOD", b"GET")];
        let mut input = test_support::request_input(false, params, b"");
        // Never read, since the first request closes the connection
        test_support::add_begin(&mut input, 2, Role::Responder, false);

        let mut out = Vec::new();
        let mut calls = 0;
        serve(Cursor::new(input), &mut out, Arc::new(Config::default()), |r| {
            calls += 1;
            echo(r).boxed()
        })
        .await?;
        assert_eq!(calls, 1);
        assert_eq!(test_support::end_requests(&out).len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_input() {
        let mut input = test_support::request_input(true, &[], b"");
        input.extend([9, 1, 0, 1, 0, 0, 0, 0]);
        let mut out = Vec::new();
        let res = serve(Cursor::new(input), &mut out, Arc::new(Config::default()), |r| echo(r).boxed()).await;
        assert!(matches!(res, Err(Error::MalformedHeader(_))));
    }

    #[tokio::test]
    async fn runner_limits_connections() {
        let config = Config::with_conns(NonZeroU32::MIN);
        let mut runner = config.async_runner();
        let token = runner.get_token().await;
        assert_eq!(runner.active(), 1);
        assert!(runner.get_token().now_or_never().is_none());
        drop(token);

        let token = runner.get_token().await;
        let mut shutdown = Box::pin(runner.shutdown());
        assert!((&mut shutdown).now_or_never().is_none());
        let mut out = Vec::new();
        let input = test_support::request_input(false, &[], b"");
        token.run(Cursor::new(input), &mut out, |r| echo(r).boxed()).await.unwrap();
        assert!(shutdown.now_or_never().is_some());
        assert_eq!(test_support::end_requests(&out).len(), 1);
    }
}
