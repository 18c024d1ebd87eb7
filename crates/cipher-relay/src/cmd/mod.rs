use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, INTERNAL};
use crate::output::OutputFormat;

pub mod local;
pub mod remote;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the local SOCKS5/HTTP proxy side.
    Local(LocalArgs),
    /// Run the remote relay side.
    Remote(RemoteArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Local(args) => local::run(args, format),
        Command::Remote(args) => remote::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct LocalArgs {
    /// JSON configuration file.
    #[arg(long, value_name = "FILE", env = "CIPHER_RELAY_CONFIG")]
    pub config: Option<PathBuf>,
    /// Proxy listener as ADDR or MODE@ADDR (mode: socks5, http, mixed). Repeatable.
    #[arg(
        long = "listen",
        value_name = "LISTENER",
        env = "CIPHER_RELAY_LISTEN",
        value_delimiter = ','
    )]
    pub listen: Vec<String>,
    /// Remote relay address.
    #[arg(long, value_name = "ADDR", env = "CIPHER_RELAY_REMOTE")]
    pub remote: Option<String>,
    /// Shared secret; must match the remote relay.
    #[arg(long, env = "CIPHER_RELAY_SECRET", hide_env_values = true)]
    pub secret: Option<String>,
    /// Require SOCKS5 username/password authentication with this username.
    #[arg(long, env = "CIPHER_RELAY_SOCKS_USERNAME", requires = "socks_password")]
    pub socks_username: Option<String>,
    /// Password for SOCKS5 authentication.
    #[arg(
        long,
        env = "CIPHER_RELAY_SOCKS_PASSWORD",
        hide_env_values = true,
        requires = "socks_username"
    )]
    pub socks_password: Option<String>,
    /// Cap on concurrently relayed client connections.
    #[arg(long, env = "CIPHER_RELAY_MAX_STREAMS")]
    pub max_streams: Option<usize>,
    /// Cap on pooled transport connections to the remote relay.
    #[arg(long)]
    pub max_connections: Option<usize>,
    /// Remote relay connect timeout (e.g. 10s, 500ms).
    #[arg(long, value_name = "DURATION")]
    pub connect_timeout: Option<String>,
    /// Time to wait for the remote to confirm a new stream.
    #[arg(long, value_name = "DURATION")]
    pub open_timeout: Option<String>,
    /// Time in-flight relays get to finish on shutdown.
    #[arg(long, value_name = "DURATION")]
    pub shutdown_grace: Option<String>,
}

#[derive(Args, Debug)]
pub struct RemoteArgs {
    /// JSON configuration file.
    #[arg(long, value_name = "FILE", env = "CIPHER_RELAY_CONFIG")]
    pub config: Option<PathBuf>,
    /// Address to accept local relays on.
    #[arg(long, value_name = "ADDR", env = "CIPHER_RELAY_REMOTE_LISTEN")]
    pub listen: Option<String>,
    /// Shared secret; must match the local relays.
    #[arg(long, env = "CIPHER_RELAY_SECRET", hide_env_values = true)]
    pub secret: Option<String>,
    /// Destination connect timeout (e.g. 10s, 500ms).
    #[arg(long, value_name = "DURATION")]
    pub connect_timeout: Option<String>,
    /// Time open streams get to finish on shutdown.
    #[arg(long, value_name = "DURATION")]
    pub shutdown_grace: Option<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("cipher-relay")
        .build()
        .map_err(|err| CliError::new(INTERNAL, format!("runtime setup failed: {err}")))
}

pub(crate) async fn wait_for_ctrl_c() -> CliResult<()> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))?;
    tracing::info!("interrupt received");
    Ok(())
}
