use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use std::process::Command;

mod cfg;
mod context;
mod envdiff;
mod launcher;
mod naming;
mod resolve;
mod scripts;
mod util;

use context::Context;
use naming::OrbNamingService;

#[derive(Parser, Debug)]
#[command(name = "helios", version, about = "Helios platform launcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a Helios session: servers, then the GUI or trailing scripts
    Start(SessionArgs),
    /// Initialize the Helios context and open a subshell
    Context(ConfigArgs),
    /// Initialize the context, then execute trailing scripts (or a shell)
    Shell(SessionArgs),
    /// Connect a console to the active session
    Connect(ConfigArgs),
    /// Terminate sessions running on the given ports
    Kill { ports: Vec<u16> },
    /// Terminate every session of the current user
    Killall,
    /// Run the platform test driver
    Test(TestArgs),
    /// Display information about the installation
    Info(InfoArgs),
    #[command(hide = true)]
    Coffee,
}

#[derive(Parser, Debug)]
struct ConfigArgs {
    /// Context files or folders, comma-separated
    #[arg(long, value_name = "LIST")]
    config: Vec<String>,

    /// Legacy .sh environment files whose contribution is computed by diff
    #[arg(long = "extra_env", value_name = "LIST")]
    extra_env: Vec<String>,
}

#[derive(Parser, Debug)]
struct SessionArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Launch the GUI session (default)
    #[arg(short, long)]
    gui: bool,

    /// Launch servers without the GUI; scripts run in the terminal
    #[arg(short, long, conflicts_with = "gui")]
    tui: bool,

    /// Script mini-language: script.py args:a,b out:x ... [-- raw command]
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    scripts: Vec<String>,
}

#[derive(Parser, Debug)]
struct TestArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Arguments forwarded to the test driver
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Show list of busy ports (running sessions)
    #[arg(short = 'p', long)]
    ports: bool,

    /// Show the launcher version
    #[arg(short = 'v', long)]
    version: bool,
}

/// Sub-command names the pre-parser recognizes; anything else defaults to
/// `start`, so `helios case.py` works like `helios start case.py`.
const COMMANDS: &[&str] = &[
    "start", "context", "shell", "connect", "kill", "killall", "test", "info", "help", "coffee",
];

fn main() -> Result<()> {
    init_tracing();

    let mut argv: Vec<String> = std::env::args().collect();
    // everything after `--` bypasses both clap and script resolution
    let passthrough: Vec<String> = match argv.iter().position(|arg| arg == "--") {
        Some(pos) => argv.split_off(pos),
        None => Vec::new(),
    };
    let cli = Cli::parse_from(normalize_argv(argv));

    match cli.command {
        Commands::Start(args) => cmd_start(args, &passthrough),
        Commands::Shell(args) => cmd_shell(args, &passthrough),
        Commands::Context(args) => cmd_context(args),
        Commands::Connect(args) => cmd_connect(args),
        Commands::Kill { ports } => cmd_kill(&ports),
        Commands::Killall => cmd_killall(),
        Commands::Test(args) => cmd_test(args),
        Commands::Info(args) => cmd_info(args),
        Commands::Coffee => {
            print_coffee();
            Ok(())
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("HELIOS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn normalize_argv(mut argv: Vec<String>) -> Vec<String> {
    let known = argv
        .get(1)
        .map(|arg| {
            COMMANDS.contains(&arg.as_str())
                || matches!(arg.as_str(), "-h" | "--help" | "-V" | "--version")
        })
        .unwrap_or(false);
    if !known {
        argv.insert(1, "start".to_string());
    }
    argv
}

/// Reassemble the raw option stream the resolver scans: `--config=`/
/// `--extra_env=` tokens, then the trailing script arguments.
fn option_stream(config: &ConfigArgs, scripts: &[String], passthrough: &[String]) -> Vec<String> {
    let mut raw = Vec::new();
    raw.extend(
        config
            .config
            .iter()
            .map(|list| format!("{}{list}", resolve::CONFIG_PREFIX)),
    );
    raw.extend(
        config
            .extra_env
            .iter()
            .map(|list| format!("{}{list}", resolve::EXTRA_ENV_PREFIX)),
    );
    raw.extend(scripts.iter().cloned());
    raw.extend(passthrough.iter().cloned());
    raw
}

/// Resolve context files from the raw stream and build the context.
/// Missing files are warnings, never auto-corrected.
fn build_context(raw: &[String]) -> Result<(Context, Vec<String>)> {
    let gathered = resolve::gather(raw)?;
    for missing in &gathered.missing {
        tracing::warn!(path = %missing.display(), "requested context file does not exist");
    }
    let mut context = Context::from_files(&gathered.files)?;
    context.extend_plain(&gathered.extra_env);
    Ok((context, gathered.remaining_args))
}

fn cmd_start(args: SessionArgs, passthrough: &[String]) -> Result<()> {
    let raw = option_stream(&args.config, &args.scripts, passthrough);
    let (context, rest) = build_context(&raw)?;
    let search_paths = context.script_search_paths();
    context.apply();

    let invocations = scripts::tokenize_scripts(&rest, &search_paths)?;
    let naming = OrbNamingService::locate()?;
    launcher::start_session(wants_gui(&args), &invocations, &naming)
}

/// GUI is the default; `--tui` turns it off and clap rejects the
/// combination of both flags.
fn wants_gui(args: &SessionArgs) -> bool {
    args.gui || !args.tui
}

fn cmd_shell(args: SessionArgs, passthrough: &[String]) -> Result<()> {
    let raw = option_stream(&args.config, &args.scripts, passthrough);
    let (context, rest) = build_context(&raw)?;
    let search_paths = context.script_search_paths();
    context.apply();

    let invocations = scripts::tokenize_scripts(&rest, &search_paths)?;
    if invocations.is_empty() {
        return interactive_shell();
    }
    launcher::run_scripts(&invocations)
}

fn cmd_context(args: ConfigArgs) -> Result<()> {
    let raw = option_stream(&args, &[], &[]);
    let (context, _) = build_context(&raw)?;
    context.apply();

    if std::env::var("HELIOS_CONTEXT_SET").is_ok() {
        println!("***");
        println!("*** Helios context has already been set.");
        println!("*** Enter 'exit' (only once!) to leave it.");
        println!("***");
        return Ok(());
    }
    std::env::set_var("HELIOS_CONTEXT_SET", "yes");
    println!("***");
    println!("*** Helios context is now set.");
    println!("*** Enter 'exit' (only once!) to leave it.");
    println!("***");
    interactive_shell()
}

fn cmd_connect(args: ConfigArgs) -> Result<()> {
    let raw = option_stream(&args, &[], &[]);
    let (context, _) = build_context(&raw)?;
    context.apply();

    let console = which::which("helios_console")
        .map_err(|err| anyhow::anyhow!("console binary not found: helios_console: {err}"))?;
    let status = Command::new(console)
        .status()
        .context("spawn helios_console")?;
    if !status.success() {
        bail!("console exited with status {:?}", status.code());
    }
    Ok(())
}

fn cmd_kill(ports: &[u16]) -> Result<()> {
    if ports.is_empty() {
        println!("Port number(s) not provided to command: helios kill <port(s)>");
        return Ok(());
    }
    for &port in ports {
        let list = launcher::KillList::for_port(port)?;
        if list.exists() {
            list.kill()?;
        } else {
            tracing::warn!(port, "no session registered on this port");
        }
    }
    Ok(())
}

fn cmd_killall() -> Result<()> {
    for port in launcher::busy_ports()? {
        launcher::KillList::for_port(port)?.kill()?;
    }
    Ok(())
}

fn cmd_test(args: TestArgs) -> Result<()> {
    let raw = option_stream(&args.config, &[], &[]);
    let (context, _) = build_context(&raw)?;
    context.apply();

    let driver = which::which("helios_test_driver")
        .map_err(|err| anyhow::anyhow!("test driver not found: helios_test_driver: {err}"))?;
    let status = Command::new(driver)
        .args(&args.args)
        .status()
        .context("spawn helios_test_driver")?;
    if !status.success() {
        bail!("test driver exited with status {:?}", status.code());
    }
    Ok(())
}

fn cmd_info(args: InfoArgs) -> Result<()> {
    let show_version = args.version || !args.ports;
    if args.ports {
        let ports = launcher::busy_ports()?;
        if ports.is_empty() {
            println!("No running Helios session.");
        } else {
            let rendered: Vec<String> = ports.iter().map(u16::to_string).collect();
            println!("Helios sessions are running on ports: {}", rendered.join(" "));
            if let Some(last) = ports.last() {
                println!("Last started session on port {last}");
            }
        }
    }
    if show_version {
        println!("Helios launcher {}", env!("CARGO_PKG_VERSION"));
    }
    Ok(())
}

fn interactive_shell() -> Result<()> {
    let status = Command::new("/bin/bash").status().context("spawn /bin/bash")?;
    if !status.success() {
        bail!("shell exited with status {:?}", status.code());
    }
    Ok(())
}

fn print_coffee() {
    println!(
        r#"
          (   (
           )   )
        .........
        |       |]
        \       /    HELIOS
         `-----'    4 EVER <3

   Helios is working for you; what else?
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_leading_token_defaults_to_start() {
        let argv = vec!["helios".to_string(), "case.py".to_string()];
        let normalized = normalize_argv(argv);
        assert_eq!(normalized[1], "start");
        assert_eq!(normalized[2], "case.py");
    }

    #[test]
    fn known_subcommands_are_left_alone() {
        let argv = vec!["helios".to_string(), "info".to_string()];
        let normalized = normalize_argv(argv);
        assert_eq!(normalized[1], "info");
        assert_eq!(normalized.len(), 2);
    }

    #[test]
    fn bare_invocation_defaults_to_start() {
        let normalized = normalize_argv(vec!["helios".to_string()]);
        assert_eq!(normalized, vec!["helios".to_string(), "start".to_string()]);
    }

    #[test]
    fn tui_flag_turns_the_gui_off() {
        let cli = Cli::try_parse_from(["helios", "start", "--tui"]).expect("parse");
        let Commands::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert!(!wants_gui(&args));
    }

    #[test]
    fn gui_is_the_default_and_conflicts_with_tui() {
        let cli = Cli::try_parse_from(["helios", "start"]).expect("parse");
        let Commands::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert!(wants_gui(&args));
        assert!(Cli::try_parse_from(["helios", "start", "--gui", "--tui"]).is_err());
    }

    #[test]
    fn option_stream_rebuilds_resolver_tokens() {
        let config = ConfigArgs {
            config: vec!["/etc/helios".to_string()],
            extra_env: vec!["/opt/legacy.sh".to_string()],
        };
        let stream = option_stream(
            &config,
            &["case.py".to_string()],
            &["--".to_string(), "ls".to_string()],
        );
        assert_eq!(
            stream,
            vec![
                "--config=/etc/helios".to_string(),
                "--extra_env=/opt/legacy.sh".to_string(),
                "case.py".to_string(),
                "--".to_string(),
                "ls".to_string(),
            ]
        );
    }
}
