use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use displot::{
    CommandCheck, CommandLauncher, DISPLOT_VERSION, DisplayConfig, HostInfo, SessionManager,
    SessionRegistry, StateFile, check_command_line,
};

const USAGE: &str = "\
Usage: displot run [options] -- <command...>
       displot status [--state <file>]

Options:
  --host <name>       Host whose display range is used [default: $HOSTNAME]
  --state <file>      Allocator state file [default: $DISPLOT_STATE or <tmp>/displot-state.json]
  --command <cmd>     Display server command line, with $DISPLAY_NUMBER
  --min <n>           Lowest display number [default: 10]
  --max <n>           Highest display number [default: 99]
  --retries <n>       Extra launch attempts after a failure [default: 10]
  --clean-up          Kill stale servers and remove X lock files first
  --version           Print version and exit";

#[derive(Debug, Default)]
struct RunArgs {
    host: Option<String>,
    state: Option<PathBuf>,
    command: Option<String>,
    min: Option<u32>,
    max: Option<u32>,
    retries: Option<u32>,
    clean_up: bool,
    argv: Vec<String>,
}

#[derive(Debug)]
enum Cli {
    Run(RunArgs),
    Status { state: Option<PathBuf> },
    Version,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    let result = match cli {
        Cli::Version => {
            println!("displot {DISPLOT_VERSION}");
            Ok(0)
        }
        Cli::Status { state } => status(state).map(|()| 0),
        Cli::Run(args) => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")
            .and_then(|rt| rt.block_on(run(args))),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("DISPLOT_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("displot={level},displot_cli={level}"))
    };

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Cli, String> {
    let subcommand = args.get(1).map(String::as_str);
    match subcommand {
        Some("run") => parse_run(&args[2..]).map(Cli::Run),
        Some("status") => parse_status(&args[2..]),
        Some("--version") | Some("-V") => Ok(Cli::Version),
        Some("--help") | Some("-h") => Err(String::new()),
        Some(other) => Err(format!("unknown subcommand: {other}")),
        None => Err("missing subcommand".to_string()),
    }
}

fn parse_run(args: &[String]) -> Result<RunArgs, String> {
    let mut run = RunArgs::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--host" => run.host = Some(value(args, &mut i)?.to_string()),
            "--state" => run.state = Some(PathBuf::from(value(args, &mut i)?)),
            "--command" => run.command = Some(value(args, &mut i)?.to_string()),
            "--min" => run.min = Some(number(args, &mut i)?),
            "--max" => run.max = Some(number(args, &mut i)?),
            "--retries" => run.retries = Some(number(args, &mut i)?),
            "--clean-up" => run.clean_up = true,
            "--help" | "-h" => return Err(String::new()),
            "--" => {
                run.argv = args[i + 1..].to_vec();
                break;
            }
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            _ => {
                run.argv = args[i..].to_vec();
                break;
            }
        }
        i += 1;
    }

    if run.argv.is_empty() {
        return Err("missing command to run".to_string());
    }
    Ok(run)
}

fn parse_status(args: &[String]) -> Result<Cli, String> {
    let mut state = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--state" => state = Some(PathBuf::from(value(args, &mut i)?)),
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }
    Ok(Cli::Status { state })
}

fn value<'a>(args: &'a [String], i: &mut usize) -> Result<&'a str, String> {
    let flag = &args[*i];
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn number(args: &[String], i: &mut usize) -> Result<u32, String> {
    let flag = args[*i].clone();
    let raw = value(args, i)?;
    raw.parse()
        .map_err(|_| format!("{flag} expects a number, got '{raw}'"))
}

fn state_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os("DISPLOT_STATE").map(PathBuf::from))
        .unwrap_or_else(|| std::env::temp_dir().join("displot-state.json"))
}

fn status(state: Option<PathBuf>) -> Result<()> {
    let file = StateFile::new(state_path(state));
    let Some(doc) = file
        .read()
        .with_context(|| format!("failed to read {}", file.path().display()))?
    else {
        println!("{{}}");
        return Ok(());
    };
    let json = serde_json::to_string_pretty(&doc).context("failed to serialize state")?;
    println!("{json}");
    Ok(())
}

async fn run(args: RunArgs) -> Result<i32> {
    let mut config = DisplayConfig::from_env().context("invalid DISPLOT_* configuration")?;
    if let Some(command) = args.command {
        config = config.with_command(command);
    }
    let min = args.min.unwrap_or(config.min_display);
    let max = args.max.unwrap_or(config.max_display);
    config = config.with_range(min, max);
    if let Some(retries) = args.retries {
        config = config.with_retries(retries);
    }
    if args.clean_up {
        config = config.with_clean_up(true);
    }
    config.validate()?;

    if let Some(command) = &config.command
        && check_command_line(command) == CommandCheck::MissingDisplayNumber
    {
        tracing::warn!(
            %command,
            "Display server command does not use $DISPLAY_NUMBER; concurrent runs will collide"
        );
    }

    let host = args
        .host
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string());

    let store = StateFile::new(state_path(args.state));
    let registry = SessionRegistry::load(store, config.min_display, config.max_display)
        .context("failed to load allocator state")?;
    let launcher = CommandLauncher::from_config(&config);
    let manager = SessionManager::new(registry, config);

    let session = manager
        .start(&HostInfo::new(host), &launcher)
        .await
        .context("failed to start display server")?;

    let (program, rest) = match args.argv.split_first() {
        Some(split) => split,
        None => bail!("missing command to run"),
    };
    let mut command = Command::new(program);
    command.args(rest);
    if let Some(session) = &session {
        command.env("DISPLAY", session.display());
    }

    let outcome = match command.spawn() {
        Ok(mut child) => {
            tokio::select! {
                status = child.wait() => status
                    .map(|s| s.code().unwrap_or(1))
                    .with_context(|| format!("failed to wait for '{program}'")),
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted, stopping command");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "Failed to kill command");
                    }
                    Ok(130)
                }
            }
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("failed to run '{program}'"))),
    };

    if let Some(session) = session
        && let Err(e) = session.teardown(&launcher).await
    {
        tracing::warn!(error = %e, "Display server teardown failed");
    }

    outcome
}
