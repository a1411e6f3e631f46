//! Gateway configuration loading.
//!
//! The gateway section is validated field-by-field (raw TOML struct with
//! optional fields, converted to a fully-populated config), because bad
//! listener settings should fail startup loudly. The shared broker,
//! database, and logging sections come from `fleet-infra`.

use fleet_infra::config::{BrokerConfig, ConfigError, DatabaseConfig, LoggingConfig};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Fully validated gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub gateway: GatewaySection,
    pub broker: BrokerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct GatewaySection {
    pub bind_ip: String,
    pub port: u16,
    pub listen_backlog: u32,
    pub max_concurrent_connections: usize,
    /// Read-idle window; a silent connection is closed after this.
    pub idle_timeout: Duration,
    /// Outbox rows older than this move to history as `failed`.
    pub outbox_timeout: Duration,
    /// Sent rows without a reply older than this become `no_reply`.
    pub reply_timeout: Duration,
    /// Devices report local time shifted by this many minutes from UTC.
    /// Zero means devices already report UTC.
    pub device_utc_offset_minutes: i32,
    /// Outbox poll cadence.
    pub command_poll_interval: Duration,
    pub command_batch_size: i64,
    /// Pause between consecutive commands to the same device.
    pub inter_command_delay: Duration,
    /// Staging buffer capacity between decoders and the broker task.
    pub staging_buffer: usize,
    /// Connection-table sweep cadence.
    pub sweep_interval: Duration,
    pub health_bind: String,
}

impl GatewaySection {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_ip, self.port)
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    gateway: Option<RawGatewaySection>,
    broker: BrokerConfig,
    database: DatabaseConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Default, Deserialize)]
struct RawGatewaySection {
    bind_ip: Option<String>,
    port: Option<u16>,
    listen_backlog: Option<u32>,
    max_concurrent_connections: Option<usize>,
    idle_timeout: Option<u64>,
    outbox_timeout_minutes: Option<u64>,
    reply_timeout_minutes: Option<u64>,
    device_utc_offset_minutes: Option<i32>,
    command_poll_interval: Option<u64>,
    command_batch_size: Option<i64>,
    inter_command_delay_ms: Option<u64>,
    staging_buffer: Option<usize>,
    sweep_interval: Option<u64>,
    health_bind: Option<String>,
}

pub fn load_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = fleet_infra::config::load_config(path)?;
    from_raw(raw)
}

pub fn load_from_str(toml_str: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(ConfigError::Parse)?;
    from_raw(raw)
}

fn from_raw(raw: RawConfig) -> Result<GatewayConfig, ConfigError> {
    let g = raw.gateway.unwrap_or_default();

    let port = g.port.unwrap_or(5027);
    if port == 0 {
        return Err(ConfigError::InvalidValue("gateway.port must not be 0".into()));
    }
    let max_conns = g.max_concurrent_connections.unwrap_or(5000);
    if max_conns == 0 {
        return Err(ConfigError::InvalidValue(
            "gateway.max_concurrent_connections must be at least 1".into(),
        ));
    }
    let batch = g.command_batch_size.unwrap_or(50);
    if batch < 1 {
        return Err(ConfigError::InvalidValue(
            "gateway.command_batch_size must be at least 1".into(),
        ));
    }

    Ok(GatewayConfig {
        gateway: GatewaySection {
            bind_ip: g.bind_ip.unwrap_or_else(|| "0.0.0.0".to_owned()),
            port,
            listen_backlog: g.listen_backlog.unwrap_or(1024),
            max_concurrent_connections: max_conns,
            idle_timeout: Duration::from_secs(g.idle_timeout.unwrap_or(600)),
            outbox_timeout: Duration::from_secs(60 * g.outbox_timeout_minutes.unwrap_or(1)),
            reply_timeout: Duration::from_secs(60 * g.reply_timeout_minutes.unwrap_or(2)),
            device_utc_offset_minutes: g.device_utc_offset_minutes.unwrap_or(0),
            command_poll_interval: Duration::from_secs(g.command_poll_interval.unwrap_or(5)),
            command_batch_size: batch,
            inter_command_delay: Duration::from_millis(g.inter_command_delay_ms.unwrap_or(1500)),
            staging_buffer: g.staging_buffer.unwrap_or(10_000),
            sweep_interval: Duration::from_secs(g.sweep_interval.unwrap_or(60)),
            health_bind: g.health_bind.unwrap_or_else(|| "0.0.0.0:9100".to_owned()),
        },
        broker: raw.broker,
        database: raw.database,
        logging: raw.logging,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [broker]
        user = "guest"
        password = "guest"

        [database]
        name = "fleet"
        user = "fleet"
        password = "fleet"
    "#;

    #[test]
    fn defaults_fill_in() {
        let cfg = load_from_str(MINIMAL).unwrap();
        assert_eq!(cfg.gateway.port, 5027);
        assert_eq!(cfg.gateway.outbox_timeout, Duration::from_secs(60));
        assert_eq!(cfg.gateway.reply_timeout, Duration::from_secs(120));
        assert_eq!(cfg.gateway.device_utc_offset_minutes, 0);
        assert_eq!(cfg.gateway.listen_addr(), "0.0.0.0:5027");
    }

    #[test]
    fn explicit_section_overrides() {
        let toml_str = format!(
            "{MINIMAL}\n[gateway]\nport = 6001\nidle_timeout = 30\noutbox_timeout_minutes = 3\n"
        );
        let cfg = load_from_str(&toml_str).unwrap();
        assert_eq!(cfg.gateway.port, 6001);
        assert_eq!(cfg.gateway.idle_timeout, Duration::from_secs(30));
        assert_eq!(cfg.gateway.outbox_timeout, Duration::from_secs(180));
    }

    #[test]
    fn zero_connections_rejected() {
        let toml_str = format!("{MINIMAL}\n[gateway]\nmax_concurrent_connections = 0\n");
        assert!(matches!(
            load_from_str(&toml_str),
            Err(ConfigError::InvalidValue(_))
        ));
    }
}
