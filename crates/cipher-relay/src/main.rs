mod cmd;
mod config;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(
    name = "cipher-relay",
    version,
    about = "Encrypted, multiplexed relay for SOCKS5 and HTTP proxy traffic"
)]
struct Cli {
    /// Output format for reports.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(
        long,
        value_name = "FORMAT",
        default_value = "text",
        env = "CIPHER_RELAY_LOG_FORMAT",
        global = true
    )]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "info",
        env = "CIPHER_RELAY_LOG_LEVEL",
        global = true
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_with_repeated_listeners() {
        let cli = Cli::try_parse_from([
            "cipher-relay",
            "local",
            "--listen",
            "socks5@127.0.0.1:1080",
            "--listen",
            "http@127.0.0.1:8080",
            "--remote",
            "relay.test:9528",
            "--secret",
            "s",
        ])
        .expect("local args should parse");

        match cli.command {
            Command::Local(args) => {
                assert_eq!(args.listen.len(), 2);
                assert_eq!(args.remote.as_deref(), Some("relay.test:9528"));
            }
            other => panic!("expected local, got {other:?}"),
        }
    }

    #[test]
    fn socks_username_requires_password() {
        let err = Cli::try_parse_from([
            "cipher-relay",
            "local",
            "--secret",
            "s",
            "--socks-username",
            "alice",
        ])
        .expect_err("username alone should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn parses_remote_with_global_flags() {
        let cli = Cli::try_parse_from([
            "cipher-relay",
            "remote",
            "--listen",
            "0.0.0.0:9528",
            "--log-level",
            "debug",
            "--format",
            "json",
        ])
        .expect("remote args should parse");
        assert!(matches!(cli.command, Command::Remote(_)));
        assert_eq!(cli.log_level, LogLevel::Debug);
        assert_eq!(cli.format, Some(OutputFormat::Json));
    }

    #[test]
    fn rejects_unknown_log_level() {
        let err = Cli::try_parse_from(["cipher-relay", "--log-level", "loud", "version"])
            .expect_err("bad level should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }
}
