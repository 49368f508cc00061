use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::net::{UnixListener, UnixStream};
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

use acp_multiplex_core::{Cache, Frontend, Proxy};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multiplexing proxy for line-delimited ACP agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Session name advertised to secondary frontends
    /// (overrides ACP_MULTIPLEX_NAME).
    #[arg(short, long)]
    name: Option<String>,

    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect stdin/stdout to a running proxy's socket
    Attach { socket: PathBuf },
    /// Everything else is the agent command to supervise
    #[command(external_subcommand)]
    Agent(Vec<String>),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The primary frontend owns stdout, so logs go to stderr.
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Attach { socket } => run_attach(&socket).await,
        Commands::Agent(argv) => run_proxy(argv, cli.name).await,
    }
}

/// Start the agent subprocess and the multiplexing proxy around it.
async fn run_proxy(argv: Vec<String>, name: Option<String>) -> Result<()> {
    clean_stale_sockets();

    let (program, args) = argv.split_first().context("missing agent command")?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("start agent {}", program))?;

    let agent_in = child.stdin.take().context("agent stdin pipe")?;
    let agent_out = child.stdout.take().context("agent stdout pipe")?;

    let cache = Arc::new(Cache::new());

    // Session name for late joiners, from the flag or the environment.
    let name = name
        .or_else(|| std::env::var("ACP_MULTIPLEX_NAME").ok())
        .filter(|name| !name.is_empty());
    if let Some(name) = name {
        let meta = json!({
            "jsonrpc": "2.0",
            "method": "acp-multiplex/meta",
            "params": {"name": name},
        })
        .to_string();
        cache.set_meta(&meta).await;
    }

    let proxy = Proxy::new(Box::new(agent_in), Box::new(agent_out), cache);

    // Primary frontend on our own stdin/stdout.
    let primary = Frontend::new(
        0,
        true,
        Box::new(tokio::io::stdin()),
        Box::new(tokio::io::stdout()),
    );
    proxy.add_frontend(primary).await;

    // Unix socket for secondary frontends.
    let sock_path = socket_path();
    let listener = listen_unix(&sock_path)?;
    info!("socket {}", sock_path.display());

    let accept_proxy = proxy.clone();
    tokio::spawn(async move {
        let mut next_id: u64 = 1;
        loop {
            match listener.accept().await {
                Ok((conn, _)) => {
                    next_id += 1;
                    let (read_half, write_half) = conn.into_split();
                    let frontend =
                        Frontend::new(next_id, false, Box::new(read_half), Box::new(write_half));
                    accept_proxy.add_frontend(frontend).await;
                }
                Err(e) => {
                    error!("accept: {}", e);
                    return;
                }
            }
        }
    });

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let proxy_task = tokio::spawn(proxy.run());

    tokio::select! {
        _ = sigint.recv() => info!("interrupted"),
        _ = sigterm.recv() => info!("terminated"),
        status = child.wait() => {
            match status {
                Ok(status) => info!("agent exited: {}", status),
                Err(e) => error!("wait for agent: {}", e),
            }
            // Let the proxy finish draining pending requests.
            let _ = proxy_task.await;
        }
    }

    let _ = std::fs::remove_file(&sock_path);
    let _ = child.start_kill();
    Ok(())
}

/// Bridge stdin/stdout to a running proxy's socket. This lets stdio-only ACP
/// clients join an existing session as secondary frontends.
async fn run_attach(socket: &Path) -> Result<()> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("connect to {}", socket.display()))?;
    let (mut sock_read, mut sock_write) = stream.into_split();
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    // Either direction ending tears the bridge down.
    tokio::select! {
        _ = tokio::io::copy(&mut stdin, &mut sock_write) => {}
        _ = tokio::io::copy(&mut sock_read, &mut stdout) => {}
    }
    Ok(())
}

/// Directory holding one socket per live proxy, named <pid>.sock.
fn socket_dir() -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let dir = base.join("acp-multiplex");
    let _ = std::fs::create_dir_all(&dir);
    dir
}

fn socket_path() -> PathBuf {
    socket_dir().join(format!("{}.sock", std::process::id()))
}

fn listen_unix(path: &Path) -> Result<UnixListener> {
    let _ = std::fs::remove_file(path);
    let listener =
        UnixListener::bind(path).with_context(|| format!("listen on {}", path.display()))?;
    // Owner-only so other users on the machine can't connect.
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        warn!("chmod {}: {}", path.display(), e);
    }
    Ok(listener)
}

/// Remove sockets whose owning process is gone. Socket files are named after
/// the proxy's pid, so liveness is a kill(pid, 0) probe.
fn clean_stale_sockets() {
    let Ok(entries) = std::fs::read_dir(socket_dir()) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(pid) = name
            .strip_suffix(".sock")
            .and_then(|pid| pid.parse::<i32>().ok())
        else {
            continue;
        };
        let alive = unsafe { libc::kill(pid, 0) == 0 };
        if !alive {
            debug!("removing stale socket {}", name);
            let _ = std::fs::remove_file(entry.path());
        }
    }
}
