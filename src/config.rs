//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory
//! (or an explicit `--config` path), then applies `PIPEHUB_WORK_DIR`,
//! `PIPEHUB_LOG_LEVEL` and `PIPEHUB_SESSION_KEY` env overrides.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::AppError;

pub const DEFAULT_CONTROL_PORT: u16 = 31093;
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Executables the hub launches, resolved against `bin_dir`.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub bin_dir: PathBuf,
    pub manager: String,
    pub cleaner: String,
    pub gui: String,
    pub shell: String,
    pub aux_relay: String,
    pub debugger: String,
    /// Start the collaborative-viewer relay next to the hub.
    pub aux_relay_enabled: bool,
}

impl ProcessConfig {
    /// Resolve an executable name: absolute names are kept, bare names are
    /// looked up in `bin_dir`.
    pub fn executable(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.bin_dir.join(path)
        }
    }
}

/// Fully-resolved hub configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub hub_name: String,
    /// Working directory for the session file and management socket.
    pub work_dir: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub bind: String,
    pub control_port: u16,
    pub data_port: u16,
    /// Prefix of the shared-segment name handed to children.
    pub shm_prefix: String,
    pub reap_interval_ms: u64,
    pub shutdown_grace_ms: u64,
    pub processes: ProcessConfig,
    /// Module names that get a mirror on every hub with a UI.
    pub mirrored_modules: Vec<String>,
    /// Session key from `PIPEHUB_SESSION_KEY`. Never sourced from TOML.
    pub session_key: Option<String>,
}

impl Config {
    /// Name of the shared segment for this hub instance.
    pub fn shm_name(&self, host: &str) -> String {
        format!("{}_{}_{}", self.shm_prefix, host, self.control_port)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.work_dir.join("pipehub.sock")
    }
}

/// Raw TOML shape, the `serde` target before resolution.
#[derive(Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    hub: RawHub,
    #[serde(default)]
    processes: RawProcesses,
    #[serde(default)]
    spawn: RawSpawn,
}

#[derive(Deserialize)]
struct RawHub {
    #[serde(default = "default_hub_name")]
    name: String,
    #[serde(default = "default_work_dir")]
    work_dir: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    log_file: Option<String>,
    #[serde(default = "default_bind")]
    bind: String,
    #[serde(default = "default_control_port")]
    control_port: u16,
    /// Defaults to `control_port + 1`.
    #[serde(default)]
    data_port: Option<u16>,
    #[serde(default = "default_shm_prefix")]
    shm_prefix: String,
    #[serde(default = "default_reap_interval_ms")]
    reap_interval_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    shutdown_grace_ms: u64,
}

impl Default for RawHub {
    fn default() -> Self {
        Self {
            name: default_hub_name(),
            work_dir: default_work_dir(),
            log_level: default_log_level(),
            log_file: None,
            bind: default_bind(),
            control_port: default_control_port(),
            data_port: None,
            shm_prefix: default_shm_prefix(),
            reap_interval_ms: default_reap_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

#[derive(Deserialize)]
struct RawProcesses {
    #[serde(default)]
    bin_dir: Option<String>,
    #[serde(default = "default_manager")]
    manager: String,
    #[serde(default = "default_cleaner")]
    cleaner: String,
    #[serde(default = "default_gui")]
    gui: String,
    #[serde(default = "default_shell")]
    shell: String,
    #[serde(default = "default_aux_relay")]
    aux_relay: String,
    #[serde(default = "default_debugger")]
    debugger: String,
    #[serde(default = "default_false")]
    aux_relay_enabled: bool,
}

impl Default for RawProcesses {
    fn default() -> Self {
        Self {
            bin_dir: None,
            manager: default_manager(),
            cleaner: default_cleaner(),
            gui: default_gui(),
            shell: default_shell(),
            aux_relay: default_aux_relay(),
            debugger: default_debugger(),
            aux_relay_enabled: false,
        }
    }
}

#[derive(Deserialize)]
struct RawSpawn {
    #[serde(default = "default_mirrored_modules")]
    mirrored_modules: Vec<String>,
}

impl Default for RawSpawn {
    fn default() -> Self {
        Self {
            mirrored_modules: default_mirrored_modules(),
        }
    }
}

fn default_hub_name() -> String { "hub".to_string() }
fn default_work_dir() -> String { "~/.pipehub".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_bind() -> String { "0.0.0.0".to_string() }
fn default_control_port() -> u16 { DEFAULT_CONTROL_PORT }
fn default_shm_prefix() -> String { "pipehub".to_string() }
fn default_reap_interval_ms() -> u64 { 100 }
fn default_shutdown_grace_ms() -> u64 { 3000 }
fn default_manager() -> String { "pipehub-manager".to_string() }
fn default_cleaner() -> String { "pipehub-clean".to_string() }
fn default_gui() -> String { "pipehub-gui".to_string() }
fn default_shell() -> String { "pipehub-shell".to_string() }
fn default_aux_relay() -> String { "pipehub-relay".to_string() }
fn default_debugger() -> String { "gdb".to_string() }
fn default_mirrored_modules() -> Vec<String> { vec!["COVER".to_string()] }

fn default_false() -> bool {
    false
}

/// Env-sourced overrides. Tests pass these directly instead of mutating env vars.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub work_dir: Option<String>,
    pub log_level: Option<String>,
    pub session_key: Option<String>,
}

impl Overrides {
    pub fn from_env() -> Self {
        Self {
            work_dir: env::var("PIPEHUB_WORK_DIR").ok(),
            log_level: env::var("PIPEHUB_LOG_LEVEL").ok(),
            session_key: env::var("PIPEHUB_SESSION_KEY").ok(),
        }
    }
}

/// Load config from `path` (or `config/default.toml`), then apply env-var overrides.
///
/// An explicit path must exist; the default path falls back to built-in
/// defaults when missing.
pub fn load(path: Option<&str>) -> Result<Config, AppError> {
    let overrides = Overrides::from_env();
    match path {
        Some(p) => load_from(Path::new(p), &overrides),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                load_from(default, &overrides)
            } else {
                resolve(RawConfig::default(), None, &overrides)
            }
        }
    }
}

/// Load from an explicit path with explicit overrides.
pub fn load_from(path: &Path, overrides: &Overrides) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    resolve(parsed, path.parent(), overrides)
}

fn resolve(parsed: RawConfig, config_dir: Option<&Path>, overrides: &Overrides) -> Result<Config, AppError> {
    let h = parsed.hub;

    let work_dir = expand_home(overrides.work_dir.as_deref().unwrap_or(&h.work_dir));
    let log_level = overrides.log_level.clone().unwrap_or(h.log_level);

    if h.control_port == 0 {
        return Err(AppError::Config("control_port must not be 0".into()));
    }
    let data_port = match h.data_port {
        Some(p) => p,
        None => h.control_port.checked_add(1).ok_or_else(|| {
            AppError::Config("control_port leaves no room for a data port".into())
        })?,
    };

    let bin_dir = match parsed.processes.bin_dir {
        Some(dir) => {
            let dir = expand_home(&dir);
            match (dir.is_absolute(), config_dir) {
                (false, Some(base)) => base.join(dir),
                _ => dir,
            }
        }
        None => env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    Ok(Config {
        hub_name: h.name,
        work_dir,
        log_level,
        log_file: h.log_file.map(|f| expand_home(&f)),
        bind: h.bind,
        control_port: h.control_port,
        data_port,
        shm_prefix: h.shm_prefix,
        reap_interval_ms: h.reap_interval_ms.max(1),
        shutdown_grace_ms: h.shutdown_grace_ms,
        processes: ProcessConfig {
            bin_dir,
            manager: parsed.processes.manager,
            cleaner: parsed.processes.cleaner,
            gui: parsed.processes.gui,
            shell: parsed.processes.shell,
            aux_relay: parsed.processes.aux_relay,
            debugger: parsed.processes.debugger,
            aux_relay_enabled: parsed.processes.aux_relay_enabled,
        },
        mirrored_modules: parsed.spawn.mirrored_modules,
        session_key: overrides.session_key.clone(),
    })
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

// ── test helpers ──────────────────────────────────────────────────────────────

/// Safe `Config` for unit tests: fixed ports, nothing launched from PATH.
#[cfg(test)]
impl Config {
    pub fn test_default(work_dir: &Path) -> Self {
        Self {
            hub_name: "test-hub".into(),
            work_dir: work_dir.to_path_buf(),
            log_level: "info".into(),
            log_file: None,
            bind: "127.0.0.1".into(),
            control_port: DEFAULT_CONTROL_PORT,
            data_port: DEFAULT_CONTROL_PORT + 1,
            shm_prefix: "pipehub".into(),
            reap_interval_ms: 10,
            shutdown_grace_ms: 100,
            processes: ProcessConfig {
                bin_dir: work_dir.join("bin"),
                manager: default_manager(),
                cleaner: default_cleaner(),
                gui: default_gui(),
                shell: default_shell(),
                aux_relay: default_aux_relay(),
                debugger: default_debugger(),
                aux_relay_enabled: false,
            },
            mirrored_modules: default_mirrored_modules(),
            session_key: None,
        }
    }
}
