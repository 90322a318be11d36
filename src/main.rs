//! pipehub: control-plane hub entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Parse CLI, load config, init logger
//!   3. Resolve the session (master key or connect string)
//!   4. Bind the control port and the management socket
//!   5. Join the master (slaves only)
//!   6. Launch the manager, the front end and the aux relay
//!   7. Run the router task until the hub exits

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pipehub::config;
use pipehub::error::AppError;
use pipehub::hub::{DialRequest, Frontend, HubCore};
use pipehub::logger;
use pipehub::net::{self, Listener};
use pipehub::process::TokioProcessHost;
use pipehub::session::{self, ConnectString, Role, Session};
use pipehub::state::MemoryState;
use pipehub::supervisor::bus::{DialPurpose, HubBus};
use pipehub::supervisor::{self, control::SupervisorControl};

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32, AppError> {
    // Optional.
    let _ = dotenvy::dotenv();

    let cli = parse_cli_args();

    let mut config = config::load(cli.config_path.as_deref())?;
    if let Some(port) = cli.port {
        config.control_port = port;
        if cli.data_port.is_none() {
            config.data_port = port.saturating_add(1);
        }
    }
    if let Some(port) = cli.data_port {
        config.data_port = port;
    }
    if let Some(name) = &cli.name {
        config.hub_name = name.clone();
    }

    let (log_level, prefer_level) = match cli.log_level {
        Some(level) => (level, true),
        None => (config.log_level.as_str(), false),
    };
    logger::init(log_level, prefer_level, config.log_file.as_deref())?;

    let connect = resolve_connect(&cli, &config)?;
    let session = Session::setup(connect.as_ref(), config.session_key.as_deref())?;
    if session.role == Role::Slave {
        // The positional argument names the slave.
        if let Some(name) = &cli.positional {
            config.hub_name = name.clone();
        }
    }

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());

    info!(
        hub = %config.hub_name,
        role = ?session.role,
        work_dir = %config.work_dir.display(),
        control_port = config.control_port,
        data_port = config.data_port,
        "config loaded"
    );

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(serve(config, session, host, cli))
}

async fn serve(config: config::Config, session: Session, host: String, cli: CliArgs) -> Result<i32, AppError> {
    let shutdown = CancellationToken::new();

    let ctrlc_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, initiating shutdown");
            ctrlc_token.cancel();
        }
    });

    let bus = HubBus::new(1024);
    let control = SupervisorControl::new(64);

    let listener = Listener::bind(&config.bind, config.control_port, bus.handle.clone()).await?;
    let addr = listener.local_addr()?;

    if session.role == Role::Master {
        let connect = session.slave_connect_string(&host, addr.port());
        let path = session::persist(&config, &connect)?;
        info!(session_file = %path.display(), "session written");
        println!("{connect}");
    }

    #[cfg(feature = "management-socket")]
    supervisor::adapters::start(control.handle.clone(), config.socket_path(), shutdown.clone());

    let master = session.master.clone();
    let aux_relay = config.processes.aux_relay_enabled;
    let state = Box::new(MemoryState::new());
    let processes = Box::new(TokioProcessHost::new(bus.handle.clone()));
    let mut core = HubCore::new(config, &session, state, processes, host).with_ui(!cli.batch);
    if session.role == Role::Master {
        if let Some(workflow) = cli.positional.as_ref().filter(|p| !p.starts_with("pipehub://")) {
            core = core.with_workflow(workflow.clone(), cli.execute);
        }
    }

    if let Some((host, port)) = master {
        let request = DialRequest {
            purpose: DialPurpose::Master,
            host,
            port,
        };
        net::connect(&request, &bus.handle).await.map_err(|e| {
            AppError::Startup(format!(
                "cannot reach master hub at {}:{}: {e}",
                request.host, request.port
            ))
        })?;
    }

    core.launch_manager()?;
    if !cli.batch {
        core.launch_frontend(cli.frontend)?;
    }
    if aux_relay {
        if let Err(e) = core.launch_aux_relay() {
            warn!(error = %e, "aux relay not started");
        }
    }

    let accepting = listener.spawn(shutdown.clone());

    let code = supervisor::run(core, bus.rx, bus.handle, control.rx, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = accepting.await {
        warn!(error = %e, "listener task failed");
    }
    Ok(code)
}

/// Connect string for this run, if any.
///
/// `--connect` and a positional `pipehub://` string are taken as given.
/// `--master` builds a slave string from the configured session key or
/// the session file the master left in the work dir.
fn resolve_connect(cli: &CliArgs, config: &config::Config) -> Result<Option<ConnectString>, AppError> {
    if let Some(cs) = &cli.connect {
        return cs.parse().map(Some);
    }
    if let Some(addr) = &cli.master {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| AppError::Session(format!("expected host:port, got {addr:?}")))?;
        let port = port
            .parse()
            .map_err(|_| AppError::Session(format!("invalid master port {port:?}")))?;
        let key = match &config.session_key {
            Some(key) => key.clone(),
            None => {
                let path = session::session_file(&config.work_dir);
                let text = std::fs::read_to_string(&path).map_err(|e| {
                    AppError::Session(format!("no session key: cannot read {}: {e}", path.display()))
                })?;
                text.trim().parse::<ConnectString>()?.key
            }
        };
        return Ok(Some(ConnectString {
            role: Role::Slave,
            host: host.to_string(),
            port,
            key,
        }));
    }
    match &cli.positional {
        Some(p) if p.starts_with("pipehub://") => p.parse().map(Some),
        _ => Ok(None),
    }
}

struct CliArgs {
    log_level: Option<&'static str>,
    config_path: Option<String>,
    batch: bool,
    frontend: Frontend,
    port: Option<u16>,
    data_port: Option<u16>,
    connect: Option<String>,
    master: Option<String>,
    execute: bool,
    name: Option<String>,
    positional: Option<String>,
}

fn parse_cli_args() -> CliArgs {
    let mut verbosity = 0u8;
    let mut cli = CliArgs {
        log_level: None,
        config_path: None,
        batch: false,
        frontend: Frontend::Gui,
        port: None,
        data_port: None,
        connect: None,
        master: None,
        execute: false,
        name: None,
        positional: None,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            cli.positional = iter.next();
            break;
        }

        match arg.as_str() {
            "-h" | "--help" => {
                println!("Usage: pipehub [OPTIONS] [WORKFLOW | CONNECT-STRING | SLAVE-NAME]");
                println!();
                println!("Options:");
                println!("  -h, --help                 Print help");
                println!("  -c, --config <PATH>        Path to configuration file (default: config/default.toml)");
                println!("  -v, -vv                    Increase logging verbosity (debug, trace)");
                println!("  -b, --batch                Run without a UI front end");
                println!("  -g, --gui                  Start the graphical front end (default)");
                println!("  -s, --shell                Start the command-line front end");
                println!("  -p, --port <PORT>          Control port");
                println!("      --dataport <PORT>      Bulk data port (default: control port + 1)");
                println!("      --connect <STRING>     Join a master using a pipehub:// connect string");
                println!("      --master <HOST:PORT>   Join a master using the local session key");
                println!("  -e, --execute              Execute the workflow once loaded");
                println!("      --name <NAME>          Hub name");
                std::process::exit(0);
            }
            "-c" | "--config" => cli.config_path = Some(required(&mut iter, "-c/--config")),
            "-b" | "--batch" => cli.batch = true,
            "-g" | "--gui" => cli.frontend = Frontend::Gui,
            "-s" | "--shell" => cli.frontend = Frontend::Shell,
            "-p" | "--port" => cli.port = Some(port_arg(&mut iter, "-p/--port")),
            "--dataport" => cli.data_port = Some(port_arg(&mut iter, "--dataport")),
            "--connect" => cli.connect = Some(required(&mut iter, "--connect")),
            "--master" => cli.master = Some(required(&mut iter, "--master")),
            "-e" | "--execute" => cli.execute = true,
            "--name" => cli.name = Some(required(&mut iter, "--name")),
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            a if a.starts_with('-') => {
                eprintln!("error: unknown option {a}");
                std::process::exit(1);
            }
            _ if cli.positional.is_none() => cli.positional = Some(arg),
            _ => {
                eprintln!("error: unexpected argument {arg}");
                std::process::exit(1);
            }
        }
    }

    cli.log_level = logger::verbosity_level(verbosity);
    cli
}

fn required(iter: &mut impl Iterator<Item = String>, flag: &str) -> String {
    match iter.next() {
        Some(value) => value,
        None => {
            eprintln!("error: {flag} requires an argument");
            std::process::exit(1);
        }
    }
}

fn port_arg(iter: &mut impl Iterator<Item = String>, flag: &str) -> u16 {
    let value = required(iter, flag);
    match value.parse() {
        Ok(port) => port,
        Err(_) => {
            eprintln!("error: {flag} expects a port number, got {value:?}");
            std::process::exit(1);
        }
    }
}
