//! `pipehub-ctl`: management CLI for a running hub.
//!
//! Connects to the hub's Unix domain socket, sends one command and prints
//! the answer.
//!
//! # Usage
//!
//! ```text
//! pipehub-ctl [--socket <path>] <command>
//!
//! Commands:
//!   status       hub id, readiness and table sizes
//!   slaves       slave hubs known to the master
//!   processes    children this hub supervises
//!   quit         shut the pipeline down
//! ```
//!
//! Socket path resolution order:
//!   1. `--socket <path>` flag
//!   2. `$PIPEHUB_WORK_DIR/pipehub.sock`
//!   3. `~/.pipehub/pipehub.sock`

use std::path::PathBuf;
use std::process;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

// ── Wire types (mirrored from supervisor::control) ────────────────────────
// Inline so this binary stays independent of the hub internals. Must match
// the server-side serde representation.

#[derive(Debug, serde::Serialize)]
enum ControlCommand {
    Status,
    Slaves,
    Processes,
    Quit,
}

#[derive(Debug, serde::Deserialize)]
struct SlaveEntry {
    id: i64,
    name: String,
    ready: bool,
}

#[derive(Debug, serde::Deserialize)]
struct ProcessEntry {
    role: String,
    pid: Option<u32>,
}

#[derive(Debug, serde::Deserialize)]
enum ControlResponse {
    Status {
        uptime_ms: u64,
        hub_id: i64,
        name: String,
        master: bool,
        ready: bool,
        quitting: bool,
        connections: usize,
        slaves: usize,
        modules: usize,
        pending_links: usize,
        barrier: Option<String>,
    },
    Slaves { slaves: Vec<SlaveEntry> },
    Processes { processes: Vec<ProcessEntry> },
    Ack { message: String },
}

#[derive(Debug, serde::Deserialize)]
enum ControlError {
    Invalid { message: String },
    Unavailable { message: String },
}

#[derive(Debug, serde::Deserialize)]
enum WireResponse {
    #[serde(rename = "ok")]
    Ok(ControlResponse),
    #[serde(rename = "err")]
    Err(ControlError),
}

// ── CLI arg parsing ────────────────────────────────────────────────────────

struct Args {
    socket: Option<String>,
    command: Option<String>,
}

fn parse_args() -> Args {
    let mut socket = None;
    let mut command = None;
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--socket" | "-s" => socket = iter.next(),
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            _ if command.is_none() => command = Some(arg),
            other => {
                eprintln!("error: unexpected argument {other}");
                process::exit(1);
            }
        }
    }

    Args { socket, command }
}

fn print_help() {
    eprintln!("usage: pipehub-ctl [--socket <path>] <command>");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  status              hub id, readiness and table sizes");
    eprintln!("  slaves              slave hubs known to the master");
    eprintln!("  processes           children this hub supervises");
    eprintln!("  quit                shut the pipeline down");
    eprintln!();
    eprintln!("flags:");
    eprintln!("  --socket, -s <path>   override default socket path");
    eprintln!("  --help,   -h          print this help");
    eprintln!();
    eprintln!("socket path resolution:");
    eprintln!("  1. --socket flag");
    eprintln!("  2. $PIPEHUB_WORK_DIR/pipehub.sock");
    eprintln!("  3. ~/.pipehub/pipehub.sock");
}

fn resolve_socket_path(override_path: Option<String>) -> PathBuf {
    if let Some(p) = override_path {
        return PathBuf::from(p);
    }
    let home = dirs::home_dir();
    if let Ok(work_dir) = std::env::var("PIPEHUB_WORK_DIR") {
        let expanded = match (work_dir.strip_prefix("~/"), &home) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => PathBuf::from(&work_dir),
        };
        return expanded.join("pipehub.sock");
    }
    home.unwrap_or_else(|| PathBuf::from("."))
        .join(".pipehub")
        .join("pipehub.sock")
}

fn build_command(cmd: &str) -> Result<ControlCommand, String> {
    match cmd {
        "status" => Ok(ControlCommand::Status),
        "slaves" => Ok(ControlCommand::Slaves),
        "processes" | "ps" => Ok(ControlCommand::Processes),
        "quit" => Ok(ControlCommand::Quit),
        other => Err(format!("unknown command: {other}\n  run 'pipehub-ctl --help' for usage")),
    }
}

fn uptime(ms: u64) -> String {
    format!("{}.{:03}s", ms / 1000, ms % 1000)
}

fn print_response(resp: WireResponse) {
    match resp {
        WireResponse::Ok(r) => match r {
            ControlResponse::Status {
                uptime_ms,
                hub_id,
                name,
                master,
                ready,
                quitting,
                connections,
                slaves,
                modules,
                pending_links,
                barrier,
            } => {
                let role = if master { "master" } else { "slave" };
                println!("ok  {name} ({role}, id {hub_id})  uptime {}", uptime(uptime_ms));
                println!("    ready {ready}  quitting {quitting}");
                println!("    connections {connections}  slaves {slaves}  modules {modules}");
                println!("    pending links {pending_links}");
                if let Some(barrier) = barrier {
                    println!("    barrier {barrier}");
                }
            }
            ControlResponse::Slaves { slaves } => {
                println!("ok  slaves ({}):", slaves.len());
                for s in &slaves {
                    let state = if s.ready { "ready" } else { "joining" };
                    println!("      {:>4}  {}  {state}", s.id, s.name);
                }
            }
            ControlResponse::Processes { processes } => {
                println!("ok  processes ({}):", processes.len());
                for p in &processes {
                    match p.pid {
                        Some(pid) => println!("      {pid:>7}  {}", p.role),
                        None => println!("      {:>7}  {}", "-", p.role),
                    }
                }
            }
            ControlResponse::Ack { message } => println!("ok  {message}"),
        },
        WireResponse::Err(e) => {
            let msg = match e {
                ControlError::Invalid { message } => message,
                ControlError::Unavailable { message } => format!("unavailable: {message}"),
            };
            eprintln!("error: {msg}");
            process::exit(1);
        }
    }
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() {
    let args = parse_args();

    let Some(cmd_str) = args.command else {
        eprintln!("error: no command given");
        eprintln!("  run 'pipehub-ctl --help' for usage");
        process::exit(1);
    };

    let cmd = match build_command(&cmd_str) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    let socket_path = resolve_socket_path(args.socket);

    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: cannot start runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(socket_path, cmd)) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

async fn run(socket_path: PathBuf, cmd: ControlCommand) -> Result<(), String> {
    use tokio::net::UnixStream;

    let stream = UnixStream::connect(&socket_path).await.map_err(|e| {
        format!(
            "cannot connect to {}: {e}\n  is the hub running?",
            socket_path.display()
        )
    })?;

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let mut request = serde_json::to_string(&cmd).map_err(|e| format!("serialise error: {e}"))?;
    request.push('\n');

    writer
        .write_all(request.as_bytes())
        .await
        .map_err(|e| format!("send error: {e}"))?;

    let line = lines
        .next_line()
        .await
        .map_err(|e| format!("recv error: {e}"))?
        .ok_or_else(|| "hub closed connection without responding".to_string())?;

    let resp: WireResponse =
        serde_json::from_str(&line).map_err(|e| format!("parse response error: {e}\n  raw: {line}"))?;

    print_response(resp);
    Ok(())
}
