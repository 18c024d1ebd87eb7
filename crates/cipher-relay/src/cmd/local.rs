use cipher_relay_local::{ListenerConfig, LocalConfig, Socks5Auth};

use crate::cmd::{runtime, wait_for_ctrl_c, LocalArgs};
use crate::config::{pick_duration, FileConfig};
use crate::exit::{local_error, CliError, CliResult, SUCCESS};
use crate::output::{print_local_stats, OutputFormat};

pub fn run(args: LocalArgs, format: OutputFormat) -> CliResult<i32> {
    let file = FileConfig::load(args.config.as_deref())?;
    let config = resolve(&args, &file)?;

    runtime()?.block_on(async move {
        let handle = cipher_relay_local::start(config)
            .await
            .map_err(|err| local_error("local relay failed to start", err))?;
        for addr in handle.local_addrs() {
            tracing::info!(%addr, "accepting proxy clients");
        }

        wait_for_ctrl_c().await?;
        let stats = handle.shutdown().await;
        print_local_stats(&stats, format);
        Ok(SUCCESS)
    })
}

/// Merge flags, environment and file into a [`LocalConfig`].
pub(crate) fn resolve(args: &LocalArgs, file: &FileConfig) -> CliResult<LocalConfig> {
    let secret = args
        .secret
        .clone()
        .or_else(|| file.secret.clone())
        .ok_or_else(|| {
            CliError::usage("a shared secret is required (--secret or CIPHER_RELAY_SECRET)")
        })?;
    let section = &file.local;
    let mut config = LocalConfig::new(secret);

    let listeners = if args.listen.is_empty() {
        &section.listen
    } else {
        &args.listen
    };
    if !listeners.is_empty() {
        config.listeners = listeners
            .iter()
            .map(|value| {
                value.parse::<ListenerConfig>()
                    .map_err(|err| CliError::usage(format!("--listen {value}: {err}")))
            })
            .collect::<CliResult<_>>()?;
    }
    if let Some(remote) = args.remote.as_ref().or(section.remote.as_ref()) {
        config.remote_addr = remote.clone();
    }

    let username = args.socks_username.as_ref().or(section.socks_username.as_ref());
    let password = args.socks_password.as_ref().or(section.socks_password.as_ref());
    config.socks_auth = match (username, password) {
        (Some(username), Some(password)) => Some(Socks5Auth {
            username: username.clone(),
            password: password.clone(),
        }),
        (None, None) => None,
        _ => {
            return Err(CliError::usage(
                "SOCKS5 username and password must be given together",
            ))
        }
    };

    if let Some(max) = args.max_streams.or(section.max_streams) {
        config.max_streams = max;
    }
    if let Some(max) = args.max_connections.or(section.max_connections) {
        config.max_connections = max;
    }
    if let Some(timeout) = pick_duration(
        args.connect_timeout.as_deref(),
        section.connect_timeout.as_deref(),
    )? {
        config.connect_timeout = timeout;
    }
    if let Some(timeout) = pick_duration(
        args.open_timeout.as_deref(),
        section.open_timeout.as_deref(),
    )? {
        config.mux.open_timeout = timeout;
    }
    if let Some(grace) = pick_duration(
        args.shutdown_grace.as_deref(),
        section.shutdown_grace.as_deref(),
    )? {
        config.shutdown_grace = grace;
    }

    config
        .validate()
        .map_err(|err| local_error("invalid local configuration", err))?;
    Ok(config)
}
