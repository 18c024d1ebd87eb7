use cipher_relay_remote::RemoteConfig;

use crate::cmd::{runtime, wait_for_ctrl_c, RemoteArgs};
use crate::config::{pick_duration, FileConfig};
use crate::exit::{remote_error, CliError, CliResult, SUCCESS};
use crate::output::{print_remote_stats, OutputFormat};

pub fn run(args: RemoteArgs, format: OutputFormat) -> CliResult<i32> {
    let file = FileConfig::load(args.config.as_deref())?;
    let config = resolve(&args, &file)?;

    runtime()?.block_on(async move {
        let handle = cipher_relay_remote::start(config)
            .await
            .map_err(|err| remote_error("remote relay failed to start", err))?;
        tracing::info!(addr = %handle.local_addr(), "accepting local relays");

        wait_for_ctrl_c().await?;
        let stats = handle.shutdown().await;
        print_remote_stats(&stats, format);
        Ok(SUCCESS)
    })
}

/// Merge flags, environment and file into a [`RemoteConfig`].
pub(crate) fn resolve(args: &RemoteArgs, file: &FileConfig) -> CliResult<RemoteConfig> {
    let secret = args
        .secret
        .clone()
        .or_else(|| file.secret.clone())
        .ok_or_else(|| {
            CliError::usage("a shared secret is required (--secret or CIPHER_RELAY_SECRET)")
        })?;
    let section = &file.remote;
    let mut config = RemoteConfig::new(secret);

    if let Some(listen) = args.listen.as_ref().or(section.listen.as_ref()) {
        config.listen_addr = listen.clone();
    }
    if let Some(timeout) = pick_duration(
        args.connect_timeout.as_deref(),
        section.connect_timeout.as_deref(),
    )? {
        config.connect_timeout = timeout;
    }
    if let Some(grace) = pick_duration(
        args.shutdown_grace.as_deref(),
        section.shutdown_grace.as_deref(),
    )? {
        config.shutdown_grace = grace;
    }

    config
        .validate()
        .map_err(|err| remote_error("invalid remote configuration", err))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn file_values_apply_when_flags_absent() {
        let file = FileConfig::parse(
            r#"{ "secret": "s", "remote": { "listen": "0.0.0.0:19528", "connect_timeout": "250ms" } }"#,
        )
        .unwrap();
        let args = RemoteArgs {
            config: None,
            listen: None,
            secret: None,
            connect_timeout: None,
            shutdown_grace: None,
        };
        let config = resolve(&args, &file).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:19528");
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
    }

    #[test]
    fn default_listen_address() {
        let args = RemoteArgs {
            config: None,
            listen: None,
            secret: Some("s".to_string()),
            connect_timeout: None,
            shutdown_grace: None,
        };
        let config = resolve(&args, &FileConfig::default()).unwrap();
        assert_eq!(config.listen_addr, cipher_relay_remote::DEFAULT_LISTEN_ADDR);
    }
}
