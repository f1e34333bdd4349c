use std::io::{self, Write};
use std::net::Ipv4Addr;

use futures_util::FutureExt;
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
use tracing::Instrument;

use fastcgi_app::{async_io, cgi, commit, Config, ExitStatus, LoadTargets, Request, Response};


/// Handles a single FastCGI request. All input is buffered before the handler
/// runs, so loading the request completes immediately.
async fn handler(req: &mut Request) -> io::Result<ExitStatus> {
    use http::Method;
    req.load(LoadTargets::ENV | LoadTargets::GET | LoadTargets::COOKIES)?;
    let method = req.request_method().map(|m| Method::from_bytes(m.as_bytes()));
    let path = req.script_name().unwrap_or_default().to_owned();

    let mut resp = match (method, path.as_str()) {
        (Some(Ok(Method::GET)), "/redirect") => {
            let mut resp = Response::new();
            resp.redirect("/local?from=redirect")?;
            resp
        },
        (Some(Ok(Method::POST)), "/echo") => echo(req)?,
        (Some(Ok(Method::GET | Method::POST)), _) => hello(req)?,
        (method, _) => {
            tracing::warn!(?method, "unsupported request method");
            let fallback = http::Response::builder()
                .status(http::StatusCode::NOT_IMPLEMENTED)
                .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
                .body("HTTP method not implemented\n")
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            Response::from(fallback)
        },
    };
    Ok(commit(req, &mut resp, 0)?.into())
}

/// Prints the CGI environment.
fn hello(req: &Request) -> io::Result<Response> {
    let mut resp = Response::new();
    resp.status(http::StatusCode::OK)
        .set_header(http::header::CONTENT_TYPE.as_str(), "text/plain")?
        .set_header(http::header::VARY.as_str(), "*")?;
    writeln!(resp, "Hello async FastCGI!\n")?;

    let mut env: Vec<_> = req.env().collect();
    env.sort_unstable_by(|a, b| a.0.cmp(b.0));
    for (name, value) in env {
        writeln!(resp, "{name}={}", String::from_utf8_lossy(value))?;
    }
    Ok(resp)
}

/// Sends the parsed POST form back.
fn echo(req: &mut Request) -> io::Result<Response> {
    let mut resp = Response::new();
    resp.set_header(http::header::CACHE_CONTROL.as_str(), "no-store")?;
    match req.load(LoadTargets::POST) {
        Ok(()) => {
            resp.set_header(http::header::CONTENT_TYPE.as_str(), "text/plain; charset=utf-8")?;
            for (name, value) in req.post().iter() {
                writeln!(resp, "{name}: {value}")?;
            }
            for upload in req.uploads() {
                writeln!(resp, "{}: {} ({} bytes)", upload.field, upload.filename, upload.size)?;
            }
        },
        Err(e) => {
            tracing::info!(error = %e, content_type = req.var_str(cgi::CONTENT_TYPE), "unreadable form");
            resp.status(http::StatusCode::UNSUPPORTED_MEDIA_TYPE)
                .set_header(http::header::CONTENT_TYPE.as_str(), "text/plain")?;
            writeln!(resp, "{e}")?;
        },
    }
    Ok(resp)
}


// Single-threaded for simplicity. Real applications should use the
// multi-threaded runtime.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();
    // Allow up to 10 concurrent connections
    let config = Config::with_conns(10.try_into().unwrap());
    let mut runner = config.async_runner();

    let res = tokio::select! {
        biased;
        r = quit() => r,
        r = server(&mut runner) => r,
    };
    if let Err(e) = res {
        let error: &dyn std::error::Error = &e;
        tracing::error!(error, "server loop failed");
    }

    tracing::info!("shutting down");
    runner.shutdown().await;
}

/// Runs the FastCGI server on localhost:9000.
async fn server(runner: &mut async_io::Runner) -> io::Result<()> {
    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 9000)).await?;
    let local = listener.local_addr()?;
    tracing::info!(protocol = "tcp", %local, "server created");

    loop {
        // Take a token first, so that max_conns is respected
        let token = runner.get_token().await;
        let (mut conn, remote) = match listener.accept().await {
            Ok(c) => c,
            Err(e) => {
                let error: &dyn std::error::Error = &e;
                tracing::info!(protocol = "tcp", %local, error, "accept failed");
                continue;
            },
        };

        let span = tracing::error_span!("fastcgi_connection", protocol = "tcp", %local, %remote);
        tokio::spawn(async move {
            tracing::debug!("new connection accepted");
            let (r, w) = conn.split();
            // The token logs errors, the result stays in the JoinHandle
            token.run(r.compat(), w.compat_write(), |r| handler(r).boxed()).await
        }.instrument(span));
    }
}


/// Waits for a signal to shut the server down.
#[cfg(not(unix))]
fn quit() -> impl std::future::Future<Output = io::Result<()>> {
    tokio::signal::ctrl_c()
}

/// Waits for a signal to shut the server down.
#[cfg(unix)]
async fn quit() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = term.recv() => Ok(()),
    }
}


/// Sets up a `tracing` subscriber to stderr, filtered by `RUST_LOG`.
fn init_tracing() {
    use tracing_subscriber::{filter::LevelFilter, fmt};
    let max_level = match std::env::var("RUST_LOG") {
        Ok(var) if !var.is_empty() => var.parse::<LevelFilter>().unwrap_or_else(|e| {
            eprintln!("Ignoring `RUST_LOG={var}`: {e}");
            LevelFilter::INFO
        }),
        _ => LevelFilter::INFO,
    };

    fmt::fmt()
        .with_timer(fmt::time::uptime())
        .with_max_level(max_level)
        .with_writer(io::stderr)
        .init();
}
