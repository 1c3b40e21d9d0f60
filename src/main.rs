//! proc-sandbox - run one command under the platform sandbox
//!
//! Usage: `proc-sandbox [--config FILE] [--capture] -- COMMAND [ARGS...]`
//!
//! Limits come from the optional TOML file, then `SANDBOX_*` environment
//! variables (a `.env` file is honored). The outcome is printed as one JSON
//! object on stdout and the process exits with the child's exit code.

use anyhow::{bail, Context, Result};
use proc_sandbox::{CaptureBuffer, Output, SandboxConfig};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const USAGE: &str = "usage: proc-sandbox [--config FILE] [--capture] -- COMMAND [ARGS...]";

/// Parsed command line
#[derive(Debug, PartialEq)]
struct Cli {
    config: Option<PathBuf>,
    capture: bool,
    command: String,
    args: Vec<String>,
}

fn parse_args(argv: impl IntoIterator<Item = String>) -> Result<Cli> {
    let mut argv = argv.into_iter();
    let mut config = None;
    let mut capture = false;

    loop {
        match argv.next().as_deref() {
            Some("--config") => {
                let path = argv.next().context("--config needs a file path")?;
                config = Some(PathBuf::from(path));
            }
            Some("--capture") => capture = true,
            Some("--") => break,
            Some(other) => bail!("unexpected argument {:?}\n{}", other, USAGE),
            None => bail!("missing command\n{}", USAGE),
        }
    }

    let command = argv.next().context(USAGE)?;
    Ok(Cli {
        config,
        capture,
        command,
        args: argv.collect(),
    })
}

fn load_config(path: Option<&PathBuf>) -> Result<SandboxConfig> {
    let base = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            SandboxConfig::from_toml_str(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        }
        None => SandboxConfig::default(),
    };
    base.with_env_overrides(|name| std::env::var(name).ok())
        .context("Invalid SANDBOX_* environment variable")
}

/// JSON report printed after the run
#[derive(Serialize)]
struct Report<'a> {
    #[serde(flatten)]
    outcome: &'a proc_sandbox::Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("proc_sandbox=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let cli = parse_args(std::env::args().skip(1))?;
    let mut config = load_config(cli.config.as_ref())?;

    let captured = cli.capture.then(|| (CaptureBuffer::new(), CaptureBuffer::new()));
    if let Some((stdout, stderr)) = &captured {
        config = config
            .with_stdout(Output::Capture(stdout.clone()))
            .with_stderr(Output::Capture(stderr.clone()));
    }

    let mut sandbox = proc_sandbox::new(Some(config)).context("Failed to create sandbox")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling run");
            on_signal.cancel();
        }
    });

    info!("Running {} {:?}", cli.command, cli.args);
    let outcome = sandbox.run(&cancel, &cli.command, &cli.args).await;

    if let Err(e) = sandbox.cleanup() {
        warn!("Sandbox cleanup failed: {}", e);
    }

    let report = Report {
        outcome: &outcome,
        stdout: captured.as_ref().map(|(out, _)| out.to_string_lossy()),
        stderr: captured.as_ref().map(|(_, err)| err.to_string_lossy()),
    };
    println!(
        "{}",
        serde_json::to_string(&report).context("Failed to serialize outcome")?
    );

    if let Some(err) = outcome.error {
        return Err(err).context(format!("Could not run {}", cli.command));
    }
    std::process::exit(outcome.exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args_full() {
        let cli = parse_args(argv(&["--config", "limits.toml", "--capture", "--", "ls", "-l"])).unwrap();
        assert_eq!(
            cli,
            Cli {
                config: Some(PathBuf::from("limits.toml")),
                capture: true,
                command: "ls".to_string(),
                args: vec!["-l".to_string()],
            }
        );
    }

    #[test]
    fn test_parse_args_passes_flags_after_separator() {
        let cli = parse_args(argv(&["--", "grep", "--config", "x"])).unwrap();
        assert_eq!(cli.command, "grep");
        assert_eq!(cli.args, argv(&["--config", "x"]));
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_args_rejects_missing_command() {
        assert!(parse_args(argv(&[])).is_err());
        assert!(parse_args(argv(&["--"])).is_err());
        assert!(parse_args(argv(&["--capture", "ls"])).is_err());
        assert!(parse_args(argv(&["--config"])).is_err());
    }
}
