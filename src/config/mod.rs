use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use config::builder::DefaultState;
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allow_any_origin: bool,
    pub max_age: u32,
}

/// How the fan-out concurrency bound is shared between broadcasts.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FanoutScope {
    /// One process-wide bound across every concurrent broadcast.
    Shared,
    /// A fresh bound per broadcast call.
    PerBroadcast,
}

/// Which existing peer is asked to re-publish its state for a newcomer.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CatchUpPeer {
    First,
    Random,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub fanout_limit: usize,
    pub fanout_scope: FanoutScope,
    pub catch_up_peer: CatchUpPeer,
    pub clear_status_when_empty: bool,
    pub replay_last_status_on_join: bool,
    /// Zero disables the receive deadline.
    pub receive_timeout_secs: u64,
    pub trust_forwarded_headers: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            fanout_limit: 10,
            fanout_scope: FanoutScope::Shared,
            catch_up_peer: CatchUpPeer::First,
            clear_status_when_empty: false,
            replay_last_status_on_join: false,
            receive_timeout_secs: 0,
            trust_forwarded_headers: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub relay: RelayConfig,
}

fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
    environment: &str,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("environment", environment)?
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("server.workers", num_cpus::get() as i64)?
        .set_default("cors.enabled", true)?
        .set_default("cors.allow_any_origin", true)?
        .set_default("cors.max_age", 3600)?
        .set_default("relay.host", "127.0.0.1")?
        .set_default("relay.port", 8081)?
        .set_default("relay.fanout_limit", 10)?
        .set_default("relay.fanout_scope", "shared")?
        .set_default("relay.catch_up_peer", "first")?
        .set_default("relay.clear_status_when_empty", false)?
        .set_default("relay.replay_last_status_on_join", false)?
        .set_default("relay.receive_timeout_secs", 0)?
        .set_default("relay.trust_forwarded_headers", true)
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = with_defaults(Config::builder(), "development")?
            // Add in settings from the config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))

            // Add in settings from environment variables (with prefix "APP_")
            // E.g., `APP_RELAY__PORT=5001` would set `Settings.relay.port`
            .add_source(
                Environment::with_prefix("app")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults only, with both listeners on ephemeral ports.
    pub fn new_for_test() -> Result<Self, ConfigError> {
        let settings: Settings = with_defaults(Config::builder(), "test")?
            .set_override("server.port", 0)?
            .set_override("server.workers", 1)?
            .set_override("relay.port", 0)?
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.fanout_limit == 0 {
            return Err(ConfigError::Message(
                "relay.fanout_limit must be at least 1".to_string(),
            ));
        }
        if self.relay.port != 0 && self.relay.port == self.server.port && self.relay.host == self.server.host {
            return Err(ConfigError::Message(
                "relay.port must differ from server.port".to_string(),
            ));
        }
        Ok(())
    }
}
