//! Spawning and tracking of the platform's external CORBA server binaries.
//!
//! Servers start in a fixed dependency order; ordering is enforced by
//! polling the naming service between spawns, never by waiting on the
//! processes themselves. Spawned pids land in a per-port kill list so
//! `kill`/`killall` can tear a session down later. The orchestrator is
//! fail-fast: a spawn failure aborts the sequence and leaves the already
//! started servers for the operator to diagnose.

use crate::naming::NamingService;
use crate::scripts::{self, ScriptInvocation};
use crate::util::{short_hostname, PATH_SEP_STR};
use anyhow::{anyhow, bail, Context, Result};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Port range probed for a free naming-service port.
const PORT_RANGE: std::ops::Range<u16> = 2810..2910;

const SERVER_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
const SESSION_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

/// One external server: a fixed argument vector plus the naming-service
/// entry that signals it is ready.
pub struct ServerSpec {
    pub name: &'static str,
    pub argv: Vec<String>,
    pub wait_ns: Option<&'static str>,
}

pub fn registry_server() -> ServerSpec {
    ServerSpec {
        name: "registry",
        argv: vec![
            "helios_registry_server".to_string(),
            "--session".to_string(),
            "theSession".to_string(),
        ],
        wait_ns: Some("/Registry"),
    }
}

pub fn catalog_server() -> Result<ServerSpec> {
    Ok(ServerSpec {
        name: "module catalog",
        argv: vec![
            "helios_catalog_server".to_string(),
            "--common".to_string(),
            module_catalog_path()?,
        ],
        wait_ns: Some("/Kernel/ModuleCatalog"),
    })
}

pub fn data_server() -> ServerSpec {
    ServerSpec {
        name: "data server",
        argv: vec!["helios_data_server".to_string()],
        wait_ns: Some("/Study"),
    }
}

pub fn connection_server() -> ServerSpec {
    ServerSpec {
        name: "connection manager",
        argv: vec!["helios_connection_server".to_string()],
        wait_ns: None,
    }
}

pub fn session_server(invocations: &[ScriptInvocation]) -> Result<ServerSpec> {
    let modules = modules_list()?;
    let mut argv = vec![
        "helios_session_server".to_string(),
        "--modules".to_string(),
        modules.replace(',', ":"),
    ];
    if !invocations.is_empty() {
        // the GUI runs the scripts itself once the session is up
        argv.push(format!("--pyscript={}", scripts::pyscript_json(invocations)?));
    }
    Ok(ServerSpec {
        name: "session",
        argv,
        wait_ns: None,
    })
}

pub fn launcher_server() -> ServerSpec {
    ServerSpec {
        name: "launcher",
        argv: vec!["helios_launcher_server".to_string()],
        wait_ns: None,
    }
}

/// Start servers in order. Every spawn is non-blocking; the child handle is
/// dropped without waiting, so server lifetime is detached from the
/// orchestrator.
pub fn launch_servers(
    specs: &[ServerSpec],
    naming: &dyn NamingService,
    kill_list: &KillList,
) -> Result<()> {
    for spec in specs {
        let program = spec
            .argv
            .first()
            .ok_or_else(|| anyhow!("empty server command for {}", spec.name))?;
        let program = which::which(program)
            .map_err(|err| anyhow!("server binary not found: {program}: {err}"))?;
        let command_line = shell_words::join(spec.argv.iter().map(String::as_str));
        let child = Command::new(&program)
            .args(&spec.argv[1..])
            .spawn()
            .with_context(|| format!("spawn {} server: {command_line}", spec.name))?;
        tracing::info!(
            server = spec.name,
            pid = child.id(),
            command = %command_line,
            "started server"
        );
        kill_list.record(child.id(), &command_line)?;
        if let Some(name) = spec.wait_ns {
            naming.wait_registered(name, SERVER_WAIT_TIMEOUT)?;
        }
    }
    Ok(())
}

/// Launch a full session: free port, omniORB config, the server sequence,
/// then either the GUI session wait or sequential script execution.
pub fn start_session(
    gui: bool,
    invocations: &[ScriptInvocation],
    naming: &dyn NamingService,
) -> Result<()> {
    let port = search_free_port()?;
    prepare_orb_config(port)?;
    let kill_list = KillList::for_port(port)?;

    let mut specs = vec![
        registry_server(),
        catalog_server()?,
        data_server(),
        connection_server(),
    ];
    if gui {
        specs.push(session_server(invocations)?);
    }
    specs.push(launcher_server());
    launch_servers(&specs, naming, &kill_list)?;

    if gui {
        naming.wait_registered("/Kernel/Session", SESSION_WAIT_TIMEOUT)?;
    } else {
        run_scripts(invocations)?;
    }
    Ok(())
}

/// Run tokenized user scripts sequentially through the shell, failing fast.
pub fn run_scripts(invocations: &[ScriptInvocation]) -> Result<()> {
    for invocation in invocations {
        let command = scripts::format_invocations(std::slice::from_ref(invocation));
        tracing::info!(command = %command, "running session script");
        let status = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .status()
            .with_context(|| format!("run script: {command}"))?;
        if !status.success() {
            let code = status
                .code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "terminated by signal".to_string());
            bail!("script failed ({code}): {command}");
        }
    }
    Ok(())
}

/// Paths of every module catalog named by `$HELIOS_MODULES`, joined with
/// the path separator.
pub fn module_catalog_path() -> Result<String> {
    let modules = modules_list()?;
    module_catalog_path_with(&modules, |module| {
        std::env::var(format!("{module}_ROOT_DIR")).ok()
    })
}

fn module_catalog_path_with<F>(modules: &str, root_lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut catalogs = Vec::new();
    for module in modules.split(',').filter(|m| !m.is_empty()) {
        let Some(root) = root_lookup(module) else {
            tracing::warn!(module, "module root directory not set; catalog skipped");
            continue;
        };
        let catalog = Path::new(&root)
            .join("share")
            .join("helios")
            .join("resources")
            .join(module.to_lowercase())
            .join(format!("{module}Catalog.xml"));
        if catalog.is_file() {
            catalogs.push(catalog.display().to_string());
        } else {
            tracing::warn!(module, path = %catalog.display(), "module catalog not found");
        }
    }
    Ok(catalogs.join(PATH_SEP_STR))
}

fn modules_list() -> Result<String> {
    std::env::var("HELIOS_MODULES").map_err(|_| anyhow!("HELIOS_MODULES variable not found"))
}

/// Probe the naming-service port range for a bindable port.
pub fn search_free_port() -> Result<u16> {
    for port in PORT_RANGE {
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            tracing::debug!(port, "found free naming-service port");
            return Ok(port);
        }
    }
    bail!(
        "no free port in range {}..{}",
        PORT_RANGE.start,
        PORT_RANGE.end
    )
}

/// Write the per-port omniORB configuration file and export the variables
/// the server binaries read (`OMNIORB_CONFIG`, `NSHOST`, `NSPORT`).
pub fn prepare_orb_config(port: u16) -> Result<PathBuf> {
    let host = short_hostname();
    let user_path = omniorb_user_path()?;
    let config = user_path.join(format!(".omniORB_{host}_{port}.cfg"));
    let content = format!(
        "InitRef = NameService=corbaname::{host}:{port}\ngiopMaxMsgSize = 2097152000 # 2 GBytes\n"
    );
    std::fs::write(&config, content)
        .with_context(|| format!("write omniORB config {}", config.display()))?;
    std::env::set_var("OMNIORB_CONFIG", &config);
    std::env::set_var("NSHOST", &host);
    std::env::set_var("NSPORT", port.to_string());
    Ok(config)
}

/// Directory omniORB configuration and kill lists are written to:
/// `$OMNIORB_USER_PATH` when set, else `$HOME/<$HELIOS_APPLI>/USERS` for a
/// virtual application, else the home directory.
pub fn omniorb_user_path() -> Result<PathBuf> {
    if let Ok(value) = std::env::var("OMNIORB_USER_PATH") {
        if !value.is_empty() {
            let path = PathBuf::from(value);
            if !path.is_dir() {
                bail!(
                    "OMNIORB_USER_PATH is not a directory: {}",
                    path.display()
                );
            }
            return Ok(path);
        }
    }
    let home = dirs::home_dir().ok_or_else(|| anyhow!("home directory not found"))?;
    let path = match std::env::var("HELIOS_APPLI") {
        Ok(appli) if !appli.is_empty() => home.join(appli).join("USERS"),
        _ => home,
    };
    std::fs::create_dir_all(&path)
        .with_context(|| format!("create omniORB user path {}", path.display()))?;
    std::env::set_var("OMNIORB_USER_PATH", &path);
    Ok(path)
}

/// Per-port record of spawned server pids.
pub struct KillList {
    path: PathBuf,
}

impl KillList {
    pub fn for_port(port: u16) -> Result<Self> {
        Ok(Self::in_dir(&omniorb_user_path()?, port))
    }

    pub fn in_dir(dir: &Path, port: u16) -> Self {
        Self {
            path: dir.join(format!("helios_{port}.pids")),
        }
    }

    pub fn record(&self, pid: u32, command_line: &str) -> Result<()> {
        use std::io::Write as _;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open kill list {}", self.path.display()))?;
        writeln!(file, "{pid} {command_line}")
            .with_context(|| format!("append to kill list {}", self.path.display()))?;
        Ok(())
    }

    pub fn pids(&self) -> Result<Vec<u32>> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read kill list {}", self.path.display()))?;
        Ok(content
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .filter_map(|pid| pid.parse().ok())
            .collect())
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Signal every recorded pid with SIGTERM and drop the list.
    pub fn kill(&self) -> Result<()> {
        for pid in self.pids()? {
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc == 0 {
                tracing::info!(pid, "sent SIGTERM");
            } else {
                tracing::warn!(pid, "process already gone");
            }
        }
        std::fs::remove_file(&self.path)
            .with_context(|| format!("remove kill list {}", self.path.display()))?;
        Ok(())
    }
}

/// Ports with a kill list in `dir`, i.e. sessions started by this user.
pub fn busy_ports_in(dir: &Path) -> Vec<u16> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut ports: Vec<u16> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.strip_prefix("helios_")?
                .strip_suffix(".pids")?
                .parse()
                .ok()
        })
        .collect();
    ports.sort_unstable();
    ports
}

pub fn busy_ports() -> Result<Vec<u16>> {
    Ok(busy_ports_in(&omniorb_user_path()?))
}
