use std::io::{self, Write};
use std::net::{Ipv4Addr, TcpListener};
use std::num::NonZeroUsize;

use http::StatusCode;

use fastcgi_app::{cgi, commit, Acceptor, Config, ExitStatus, LoadTargets, Request, Response};


/// Routes a request by its `SCRIPT_NAME`. Nonzero `ExitStatus::Complete`
/// values are reported to the web server as failures.
fn handler(req: &mut Request) -> io::Result<ExitStatus> {
    if let Err(e) = req.load(LoadTargets::ALL) {
        // Form errors leave the environment loaded, so a response is possible
        tracing::warn!(error = %e, "loading request failed");
        let mut resp = Response::new();
        resp.status(StatusCode::BAD_REQUEST).set_header("Content-Type", "text/plain")?;
        writeln!(resp, "Bad request: {e}")?;
        return Ok(commit(req, &mut resp, 1)?.into());
    }

    let mut resp = Response::new();
    match req.script_name().unwrap_or_default() {
        "/redirect" => {
            resp.redirect("https://example.com/")?;
        },
        "/form" => {
            resp.set_header("Content-Type", "text/plain; charset=utf-8")?;
            for (name, value) in req.get().iter().chain(req.post().iter()) {
                writeln!(resp, "{name} = {value}")?;
            }
            for upload in req.uploads() {
                writeln!(resp, "{} <- {} ({} bytes)", upload.field, upload.filename, upload.size)?;
            }
        },
        _ => {
            resp.set_header("Content-Type", "text/plain; charset=utf-8")?;
            resp.add_header("X-Powered-By", "fastcgi-app-hello")?;
            writeln!(resp, "Hello FastCGI!\n")?;
            let mut env: Vec<_> = req.env().collect();
            env.sort_unstable_by(|a, b| a.0.cmp(b.0));
            for (name, value) in env {
                writeln!(resp, "{name}={}", String::from_utf8_lossy(value))?;
            }
            if let Some(sid) = req.cookies().get("sid") {
                writeln!(resp, "\nsession: {sid}")?;
            }
            let agent = req.var_str(cgi::HTTP_USER_AGENT).unwrap_or("unknown");
            tracing::debug!(agent, "hello served");
        },
    }
    Ok(commit(req, &mut resp, 0)?.into())
}


fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = Config::default().with_max_post(Some(16 * 1024 * 1024));

    // Web servers which spawn the application pass a listening socket as stdin
    #[cfg(unix)]
    if let Ok(listener) = fastcgi_app::transport::from_listensock() {
        tracing::info!(protocol = "unix", "serving inherited socket");
        return Ok(Acceptor::new(listener, config).run(&mut handler)?);
    }

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 9000))?;
    tracing::info!(protocol = "tcp", local = %listener.local_addr()?, "server created");
    let workers = std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN);
    Acceptor::new(listener, config).run_workers(workers, handler)?;
    Ok(())
}


/// Sets up a basic `tracing` subscriber to stderr. Its verbosity level is
/// configured with the `RUST_LOG` environment variable.
fn init_tracing() {
    use tracing_subscriber::{filter::LevelFilter, fmt};
    let max_level = std::env::var("RUST_LOG")
        .ok()
        .filter(|v| !v.is_empty())
        .and_then(|v| match v.parse::<LevelFilter>() {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("Ignoring `RUST_LOG={v}`: {e}");
                None
            },
        })
        .unwrap_or(LevelFilter::INFO);

    fmt::fmt()
        .with_timer(fmt::time::uptime())
        .with_max_level(max_level)
        .with_writer(io::stderr)
        .init();
}
