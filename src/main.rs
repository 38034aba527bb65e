use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use scriptcon::parser::parse_duration;
use scriptcon::report::exit_code;
use scriptcon::{
    ConnectOptions, OutputHandler, Overrides, RunOptions, Script, SessionError, SessionOptions,
    Target,
};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "scriptcon",
    about = "Drive an interactive console through a step script",
    version
)]
struct Args {
    /// Path to the script file (.toml or .json)
    #[arg(short, long)]
    script: PathBuf,

    /// Console address: host:port, tcp://host:port or telnet://host:port
    #[arg(short, long, visible_alias = "connect", conflicts_with = "command")]
    target: Option<String>,

    /// Run this program in a PTY and drive it instead of connecting over TCP
    #[arg(short, long)]
    command: Option<String>,

    /// Arguments to pass to the command
    #[arg(trailing_var_arg = true, requires = "command")]
    args: Vec<String>,

    /// Filter telnet negotiation out of a TCP connection
    #[arg(long)]
    telnet: bool,

    /// Set a script variable (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
    vars: Vec<(String, String)>,

    /// Default step timeout, e.g. 10s or 500ms
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// Give up on the whole session after this long
    #[arg(long, value_parser = parse_duration)]
    deadline: Option<Duration>,

    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    connect_timeout: Duration,

    /// Fail after this many step transitions
    #[arg(long)]
    max_transitions: Option<usize>,

    /// Write the decoded transcript to this file
    #[arg(long)]
    log: Option<PathBuf>,

    /// Write the session report as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Mirror console output to stdout as it arrives
    #[arg(long)]
    echo: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn parse_var(s: &str) -> Result<(String, String)> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected NAME=VALUE, got: {}", s))?;
    if name.is_empty() {
        bail!("Variable name is empty: {}", s);
    }
    Ok((name.to_string(), value.to_string()))
}

fn init_tracing(args: &Args) {
    let level = match (args.quiet, args.verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_target(args: &Args, script_target: Option<&str>) -> Result<Target> {
    let target = if let Some(program) = &args.command {
        Target::command(program, args.args.as_slice())
    } else if let Some(target) = args.target.as_deref().or(script_target) {
        target.parse()?
    } else {
        bail!("No target: pass --target or --command, or set 'target' in the script");
    };
    Ok(if args.telnet {
        target.with_telnet(true)
    } else {
        target
    })
}

fn echo_handler(enabled: bool) -> OutputHandler {
    if enabled {
        Arc::new(|data: &[u8]| {
            let mut out = std::io::stdout().lock();
            // A closed stdout must not end the session.
            let _ = out.write_all(data);
            let _ = out.flush();
        })
    } else {
        Arc::new(|_| {})
    }
}

async fn run(args: Args) -> Result<i32> {
    let script = Script::load(&args.script)?;
    let overrides = Overrides {
        vars: args.vars.iter().cloned().collect::<BTreeMap<_, _>>(),
        timeout: args.timeout,
    };
    let compiled = script
        .compile(&overrides)
        .with_context(|| format!("Invalid script: {}", args.script.display()))?;
    let target = resolve_target(&args, compiled.target.as_deref())?;

    let options = RunOptions {
        connect: ConnectOptions {
            connect_timeout: args.connect_timeout,
            ..ConnectOptions::default()
        },
        session: SessionOptions {
            deadline: args.deadline,
            max_transitions: args.max_transitions,
            output: echo_handler(args.echo),
            ..SessionOptions::default()
        },
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted");
            on_interrupt.cancel();
        }
    });

    info!(script = %compiled.name, %target, "starting session");
    let report = match scriptcon::run(&target, &compiled, options, cancel).await {
        Ok(report) => report,
        Err(e @ SessionError::Connection { .. }) => {
            error!("{e}");
            return Ok(exit_code::CONNECTION);
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(path) = &args.log {
        std::fs::write(path, report.transcript.text())
            .with_context(|| format!("Failed to write transcript: {}", path.display()))?;
    }
    if let Some(path) = &args.report {
        std::fs::write(path, report.to_json()?)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
    }

    if report.is_success() {
        info!(elapsed = ?report.elapsed, retries = report.retries, "{}", report.reason);
    } else {
        error!(
            verdict = ?report.verdict,
            step = report.terminal_step.as_deref().unwrap_or(""),
            "{}",
            report.reason
        );
    }
    Ok(report.exit_code())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(if e.use_stderr() {
                exit_code::USAGE as u8
            } else {
                exit_code::SUCCESS as u8
            });
        }
    };
    init_tracing(&args);

    match run(args).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code::USAGE as u8)
        }
    }
}
