//! Optional JSON configuration file.
//!
//! ```json
//! {
//!   "secret": "change-me",
//!   "local": { "listen": ["mixed@127.0.0.1:9527"], "remote": "relay.example:9528" },
//!   "remote": { "listen": "0.0.0.0:9528", "connect_timeout": "10s" }
//! }
//! ```
//!
//! Values given as flags or `CIPHER_RELAY_*` environment variables win over
//! the file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::exit::{CliError, CliResult, DATA_INVALID, USAGE};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub secret: Option<String>,
    pub local: LocalSection,
    pub remote: RemoteSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalSection {
    pub listen: Vec<String>,
    pub remote: Option<String>,
    pub socks_username: Option<String>,
    pub socks_password: Option<String>,
    pub max_streams: Option<usize>,
    pub max_connections: Option<usize>,
    pub connect_timeout: Option<String>,
    pub open_timeout: Option<String>,
    pub shutdown_grace: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteSection {
    pub listen: Option<String>,
    pub connect_timeout: Option<String>,
    pub shutdown_grace: Option<String>,
}

impl FileConfig {
    /// Load `path`, or an empty config when no file was given.
    pub fn load(path: Option<&Path>) -> CliResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|err| {
            CliError::new(
                USAGE,
                format!("cannot read config file {}: {err}", path.display()),
            )
        })?;
        Self::parse(&text).map_err(|err| {
            CliError::new(
                DATA_INVALID,
                format!("invalid config file {}: {}", path.display(), err.message),
            )
        })
    }

    pub fn parse(text: &str) -> CliResult<Self> {
        serde_json::from_str(text).map_err(|err| CliError::new(DATA_INVALID, err.to_string()))
    }
}

/// Parse `500ms`, `5s` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::usage("duration must not be empty"));
    }

    let (number, millis) = match input.strip_suffix("ms") {
        Some(number) => (number, true),
        None => (input.strip_suffix('s').unwrap_or(input), false),
    };
    let value: u64 = number
        .parse()
        .map_err(|_| CliError::usage(format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::usage("duration must be greater than zero"));
    }
    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

/// First of `flag` and `file` that is set, parsed as a duration.
pub fn pick_duration(flag: Option<&str>, file: Option<&str>) -> CliResult<Option<Duration>> {
    flag.or(file).map(parse_duration).transpose()
}
