//! rexec - interactive remote sessions for a remote container platform
//!
//! rexec attaches the local terminal to a command or shell the platform has
//! already provisioned. The platform hands out a session id and a WebSocket
//! endpoint; rexec streams stdin, stdout, stderr and terminal size over it
//! until the remote process exits.
//!
//! # Quick Start
//!
//! ```text
//! rexec exec exec-1 wss://host/callback ls -la    # one-shot command
//! rexec shell shell-1 wss://host/callback         # interactive shell
//! ```
//!
//! The process exits with the remote exit code, 0 after Ctrl-C or a clean
//! disconnect, and 1 on transport or protocol errors.

mod commands;
mod config;
mod core;
mod error;

use std::env;
use std::process;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

use crate::commands::{ExecArgs, ShellArgs};
use crate::config::Config;
use crate::core::{CrosstermTerminal, SessionIo, SessionRegistry, WebSocketConnector};

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit code for usage errors
const EXIT_USAGE: i32 = 2;

#[derive(Debug, PartialEq)]
enum Command {
    Exec(ExecArgs),
    Shell(ShellArgs),
    InitConfig,
    Help,
    Version,
}

/// Parsed command line
#[derive(Debug, PartialEq)]
struct Options {
    command: Command,
    verbose: bool,
    grace_ms: Option<u64>,
    no_exit_notice: bool,
}

fn print_help() {
    eprintln!("rexec {} - interactive remote sessions", VERSION);
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  rexec exec [OPTIONS] <SESSION_ID> <ENDPOINT> <COMMAND>...");
    eprintln!("  rexec shell [OPTIONS] <SESSION_ID> <ENDPOINT>");
    eprintln!("  rexec init-config");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  exec                  Run one command and stream its output");
    eprintln!("  shell                 Open an interactive shell");
    eprintln!("  init-config           Write the current configuration to ~/.rexec/config.toml");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -i, --interactive     Run exec with raw terminal and resize support");
    eprintln!("      --grace-ms <MS>   Time allowed to flush frames after the session ends");
    eprintln!("      --no-exit-notice  Do not print a notice when the remote process exits");
    eprintln!("  -v, --verbose         Debug logging");
    eprintln!("  -V, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Configuration: ~/.rexec/config.toml");
    eprintln!("Log file:      ~/.rexec/rexec.log");
}

fn parse_endpoint(raw: &str) -> Result<Url, String> {
    Url::parse(raw).map_err(|e| format!("Invalid endpoint {}: {}", raw, e))
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut verbose = false;
    let mut grace_ms = None;
    let mut no_exit_notice = false;
    let mut interactive = false;
    let mut positional: Vec<String> = Vec::new();
    let mut i = 0;

    while i < args.len() {
        let arg = args[i].as_str();
        // everything after the command words belongs to the remote command
        if positional.len() >= 3 && positional[0] == "exec" {
            positional.extend(args[i..].iter().cloned());
            break;
        }
        match arg {
            "-h" | "--help" => {
                return Ok(Options {
                    command: Command::Help,
                    verbose,
                    grace_ms,
                    no_exit_notice,
                });
            }
            "-V" | "--version" => {
                return Ok(Options {
                    command: Command::Version,
                    verbose,
                    grace_ms,
                    no_exit_notice,
                });
            }
            "-v" | "--verbose" => verbose = true,
            "-i" | "--interactive" => interactive = true,
            "--no-exit-notice" => no_exit_notice = true,
            "--grace-ms" => {
                i += 1;
                let value = args.get(i).ok_or("Missing value for --grace-ms")?;
                grace_ms = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| format!("Invalid --grace-ms value: {}", value))?,
                );
            }
            "--" => {
                positional.extend(args[i + 1..].iter().cloned());
                break;
            }
            _ if arg.starts_with('-') && arg.len() > 1 => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
            _ => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let command = match positional.first().map(String::as_str) {
        Some("exec") => {
            if positional.len() < 4 {
                return Err("exec needs <SESSION_ID> <ENDPOINT> <COMMAND>...".to_string());
            }
            Command::Exec(ExecArgs {
                session_id: positional[1].clone(),
                endpoint: parse_endpoint(&positional[2])?,
                command: positional[3..].to_vec(),
                interactive,
            })
        }
        Some("shell") => {
            if positional.len() != 3 {
                return Err("shell needs <SESSION_ID> <ENDPOINT>".to_string());
            }
            Command::Shell(ShellArgs {
                session_id: positional[1].clone(),
                endpoint: parse_endpoint(&positional[2])?,
            })
        }
        Some("init-config") => Command::InitConfig,
        Some(other) => return Err(format!("Unknown command: {}. Use -h for help.", other)),
        None => return Err("Missing command. Use -h for help.".to_string()),
    };

    Ok(Options {
        command,
        verbose,
        grace_ms,
        no_exit_notice,
    })
}

/// Log to ~/.rexec/rexec.log so log lines never land in the raw terminal
fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose { "debug" } else { config.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let log_path = Config::get_config_dir()
        .map(|dir| dir.join("rexec.log"))
        .unwrap_or_else(|| std::path::PathBuf::from("rexec.log"));

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn run(command: Command, config: &Config) -> anyhow::Result<i32> {
    if command == Command::InitConfig {
        let path = config.save().map_err(anyhow::Error::msg)?;
        eprintln!("Wrote {}", path.display());
        return Ok(0);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let registry = SessionRegistry::new(
        Arc::new(WebSocketConnector),
        Arc::new(CrosstermTerminal),
        config.session_config(),
    );

    let result = runtime.block_on(async {
        match command {
            Command::Exec(args) => {
                let io = SessionIo::stdio(args.interactive);
                commands::run_exec(&registry, args, io).await
            }
            Command::Shell(args) => commands::run_shell(&registry, args, SessionIo::stdio(true)).await,
            Command::InitConfig | Command::Help | Command::Version => Ok(0),
        }
    });

    if !registry.is_empty() {
        warn!("Closing leftover sessions {:?}", registry.list_sessions());
        runtime.block_on(registry.close_all_sessions());
    }

    // the stdin thread may still sit in a blocking read
    runtime.shutdown_background();
    result
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("rexec: error: {}", e);
            eprintln!("Use --help for usage information");
            process::exit(EXIT_USAGE);
        }
    };

    match options.command {
        Command::Help => {
            print_help();
            return;
        }
        Command::Version => {
            eprintln!("rexec {}", VERSION);
            return;
        }
        _ => {}
    }

    let (mut config, config_error) = match Config::load() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    if let Some(ms) = options.grace_ms {
        config.session.close_grace_ms = ms;
    }
    if options.no_exit_notice {
        config.session.exit_notice = false;
    }

    init_logging(&config, options.verbose);
    if let Some(e) = config_error {
        warn!("{}, using defaults", e);
    }
    info!("rexec {} starting", VERSION);

    let code = match run(options.command, &config) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("rexec: error: {:#}", e);
            1
        }
    };
    info!("rexec exiting with code {}", code);
    process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_exec() {
        let options =
            parse_args(&args(&["exec", "exec-1", "ws://host/callback", "ls", "-la"])).unwrap();
        assert_eq!(
            options.command,
            Command::Exec(ExecArgs {
                session_id: "exec-1".to_string(),
                endpoint: Url::parse("ws://host/callback").unwrap(),
                command: args(&["ls", "-la"]),
                interactive: false,
            })
        );
    }

    #[test]
    fn test_parse_exec_options_before_command() {
        let options = parse_args(&args(&[
            "-v",
            "exec",
            "-i",
            "--grace-ms",
            "500",
            "exec-1",
            "ws://host/callback",
            "top",
        ]))
        .unwrap();
        assert!(options.verbose);
        assert_eq!(options.grace_ms, Some(500));
        match options.command {
            Command::Exec(exec) => {
                assert!(exec.interactive);
                assert_eq!(exec.command, args(&["top"]));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_shell() {
        let options =
            parse_args(&args(&["shell", "--no-exit-notice", "shell-1", "wss://host/x"])).unwrap();
        assert!(options.no_exit_notice);
        assert!(matches!(options.command, Command::Shell(_)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["exec", "exec-1", "ws://host/"])).is_err());
        assert!(parse_args(&args(&["shell", "shell-1", "not a url"])).is_err());
        assert!(parse_args(&args(&["shell", "--bogus"])).is_err());
        assert!(parse_args(&args(&["--grace-ms", "soon"])).is_err());
        assert!(parse_args(&args(&["attach"])).is_err());
    }

    #[test]
    fn test_parse_help_and_version() {
        assert_eq!(parse_args(&args(&["-h"])).unwrap().command, Command::Help);
        assert_eq!(
            parse_args(&args(&["shell", "-V"])).unwrap().command,
            Command::Version
        );
    }
}
