use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use gamewire_session::SessionConfig;

use crate::exit::{session_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod config;
pub mod serve;
pub mod version;

/// Service id reserved for the methods `gamewire serve` always registers.
pub const BUILTIN_SERVICE: u16 = 0;
/// Answers with the request body.
pub const ECHO_METHOD: u16 = 1;
/// Answers with a JSON description of the calling session.
pub const WHOAMI_METHOD: u16 = 2;
/// One-way sink that logs what it receives.
pub const LOG_METHOD: u16 = 3;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept sessions on an endpoint and serve the builtin methods.
    Serve(ServeArgs),
    /// Open a session, issue one call and print the answer.
    Call(CallArgs),
    /// Validate and print the effective session configuration.
    Config(ConfigArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Call(args) => call::run(args, format),
        Command::Config(args) => config::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Config file plus the overrides every session-opening command accepts.
#[derive(Args, Debug, Default)]
pub struct SettingsArgs {
    /// JSON session config file.
    #[arg(long = "config", value_name = "FILE", env = "GAMEWIRE_CONFIG")]
    pub config_file: Option<PathBuf>,
    /// Number of event loops.
    #[arg(long, value_name = "N", env = "GAMEWIRE_LOOP_THREADS")]
    pub loop_threads: Option<usize>,
    /// Idle time after which a session is closed (e.g. 30s, 500ms).
    #[arg(long, value_name = "DURATION", env = "GAMEWIRE_SESSION_TIMEOUT")]
    pub session_timeout: Option<String>,
    /// Interval between initiator heartbeats (e.g. 10s).
    #[arg(long, value_name = "DURATION", env = "GAMEWIRE_HEARTBEAT_INTERVAL")]
    pub heartbeat_interval: Option<String>,
    /// Largest accepted frame, in bytes.
    #[arg(long, value_name = "BYTES", env = "GAMEWIRE_MAX_FRAME_SIZE")]
    pub max_frame_size: Option<usize>,
}

impl SettingsArgs {
    /// Load the config file (or defaults), apply overrides and validate.
    pub fn resolve(&self) -> CliResult<SessionConfig> {
        let mut config = match &self.config_file {
            Some(path) => SessionConfig::from_json_file(path)
                .map_err(|err| session_error("failed loading config", err))?,
            None => SessionConfig::default(),
        };
        if let Some(threads) = self.loop_threads {
            config.loop_threads = threads;
        }
        if let Some(timeout) = &self.session_timeout {
            config.session_timeout_ms = parse_duration(timeout)?.as_millis() as u64;
        }
        if let Some(interval) = &self.heartbeat_interval {
            config.heartbeat_interval_ms = parse_duration(interval)?.as_millis() as u64;
        }
        if let Some(max) = self.max_frame_size {
            config.max_frame_size = max;
        }
        config
            .validate()
            .map_err(|err| session_error("invalid configuration", err))?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Endpoint to listen on (tcp://host:port or unix:///path).
    pub endpoint: String,
    /// Require this handshake token from every initiator.
    #[arg(long, env = "GAMEWIRE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
    /// Print open sessions when stopping.
    #[arg(long)]
    pub report_sessions: bool,
    #[command(flatten)]
    pub settings: SettingsArgs,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Endpoint to connect to (tcp://host:port or unix:///path).
    pub endpoint: String,
    /// Target service id.
    #[arg(long, short = 's', default_value_t = BUILTIN_SERVICE)]
    pub service: u16,
    /// Target method id.
    #[arg(long, short = 'm', default_value_t = ECHO_METHOD)]
    pub method: u16,
    /// JSON payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Identity presented in the handshake.
    #[arg(long, default_value = "gamewire-cli", env = "GAMEWIRE_IDENTITY")]
    pub identity: String,
    /// Handshake token.
    #[arg(long, env = "GAMEWIRE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
    /// How long to wait for the handshake and the answer (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
    /// Send a one-way message instead of a call.
    #[arg(long)]
    pub one_way: bool,
    #[command(flatten)]
    pub settings: SettingsArgs,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(flatten)]
    pub settings: SettingsArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::DATA_INVALID;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").expect("2s should parse"), Duration::from_secs(2));
        assert_eq!(
            parse_duration("150ms").expect("150ms should parse"),
            Duration::from_millis(150)
        );
        assert_eq!(parse_duration("3").expect("bare seconds should parse"), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration(" ").is_err());
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let settings = SettingsArgs {
            loop_threads: Some(3),
            session_timeout: Some("45s".to_string()),
            heartbeat_interval: Some("500ms".to_string()),
            ..SettingsArgs::default()
        };
        let config = settings.resolve().expect("overrides should validate");
        assert_eq!(config.loop_threads, 3);
        assert_eq!(config.session_timeout_ms, 45_000);
        assert_eq!(config.heartbeat_interval_ms, 500);
        assert_eq!(config.ring_buffer_size, SessionConfig::default().ring_buffer_size);
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        let settings = SettingsArgs {
            loop_threads: Some(0),
            ..SettingsArgs::default()
        };
        let err = settings.resolve().expect_err("zero loops should be rejected");
        assert_eq!(err.code, DATA_INVALID);

        let settings = SettingsArgs {
            session_timeout: Some("soon".to_string()),
            ..SettingsArgs::default()
        };
        let err = settings.resolve().expect_err("bad duration should be rejected");
        assert_eq!(err.code, USAGE);
    }
}
