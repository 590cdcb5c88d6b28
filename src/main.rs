//! busd — local message broker daemon entry point.
//!
//! Binds a Unix domain socket, accepts one connection per client, and
//! spawns a thread per connection that decodes length-prefixed frames
//! (`protocol::FrameDecoder`) and feeds them to `server::dispatch`. This
//! is the thread-per-connection analogue of the teacher's
//! `broker::handle_connection` loop, generalized from "one Hub peer at a
//! time" to "every client concurrently" (§5: "preemptive parallel threads
//! of control; no cooperative single-thread assumption").

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use busd::policy::AllowAll;
use busd::protocol::{self, FrameDecoder};
use busd::{server, Bus, Config, Server, Session};

#[derive(Parser)]
#[command(name = "busd")]
#[command(version)]
#[command(about = "Local message broker: priority queues, fd transfer, and synchronous reply tracking over a Unix domain socket")]
struct Cli {
    /// Path to a JSON config file. Falls back to `Config::default()` if
    /// absent or unspecified.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the bus socket path from the config file.
    #[arg(long)]
    socket: Option<PathBuf>,
}

/// Read frames off one client socket until EOF or a framing error, run
/// each through `server::dispatch`, and write the reply frame back. Runs
/// the disconnect protocol once the client goes away, however it goes
/// away -- clean close, read error, or a write that fails mid-reply.
fn handle_client(server: Server, stream: UnixStream) {
    let mut session = Session::new();
    let mut decoder = FrameDecoder::new();
    let mut reader = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to clone client socket: {e}");
            return;
        }
    };
    let mut writer = stream;
    let mut buf = [0u8; 16 * 1024];

    'read: loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::debug!("client read error: {e}");
                break;
            }
        };
        let frames = match decoder.feed(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("framing error, dropping client: {e}");
                break;
            }
        };
        for frame in frames {
            let reply = server::dispatch(&server, &mut session, frame);
            let encoded = protocol::encode_frame(reply.frame_type, &reply.payload);
            if writer.write_all(&encoded).is_err() {
                break 'read;
            }
        }
    }

    if let Some(conn) = session.connection().cloned() {
        if let Err(e) = server::disconnect(&server, &conn) {
            log::debug!("connection {} already torn down: {e}", conn.id);
        }
    }
}

fn run(config: Config) -> Result<()> {
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating socket directory {}", parent.display()))?;
    }
    // Stale socket from a previous run that didn't shut down cleanly.
    let _ = std::fs::remove_file(&config.socket_path);

    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("binding bus socket at {}", config.socket_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // Owner-only permissions (0o600), matching spec.md §6's transport note.
        std::fs::set_permissions(&config.socket_path, std::fs::Permissions::from_mode(0o600))
            .context("setting socket permissions")?;
    }
    listener.set_nonblocking(true).context("setting listener non-blocking")?;

    log::info!("busd listening on {}", config.socket_path.display());

    let bus = Bus::new(Box::new(AllowAll));
    let server = Server::new(bus, config.clone());

    let shutdown = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler({
        let shutdown = Arc::clone(&shutdown);
        move || shutdown.store(true, Ordering::SeqCst)
    })
    .context("installing SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .context("installing SIGTERM handler")?;

    // Deferred-work poll for the Reply Tracker's timeout scan (§4.6): no
    // per-slot OS timer backs this crate's reply slots, so a dedicated
    // thread stands in for the single-shot timer the spec describes.
    {
        let server = server.clone();
        let shutdown = Arc::clone(&shutdown);
        thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                server::scan_reply_timeouts(&server);
                thread::sleep(Duration::from_millis(250));
            }
        });
    }

    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                let server = server.clone();
                thread::spawn(move || handle_client(server, stream));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                log::error!("accept error: {e}");
                break;
            }
        }
    }

    log::info!("busd shutting down");
    let _ = std::fs::remove_file(&config.socket_path);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path).context("loading config")?,
        None => Config::default(),
    };
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }

    run(config)
}
