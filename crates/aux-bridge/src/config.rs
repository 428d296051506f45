//! Bridge configuration from environment variables

use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use aux_protocol::config::STATUS_POLL_INTERVAL_MS;
use aux_protocol::transport::{BAUD_RATE, DEFAULT_TICK};
use aux_protocol::{LinkConfig, ParityMode, SerialConfig};

const DEFAULT_PORT: &str = "/dev/ttyUSB0";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub serial: SerialConfig,
    pub link: LinkConfig,
    pub tick: Duration,
    pub bind: SocketAddr,
}

impl BridgeConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// `AUX_POLL_INTERVAL_MS=0` turns periodic polling off
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let path = lookup("AUX_PORT").unwrap_or_else(|| DEFAULT_PORT.to_string());
        let baud_rate = parse_var(&lookup, "AUX_BAUD", BAUD_RATE)?;
        let parity = parse_var(&lookup, "AUX_PARITY", ParityMode::default())?;
        let poll_ms = parse_var(&lookup, "AUX_POLL_INTERVAL_MS", STATUS_POLL_INTERVAL_MS)?;
        let tick_ms = parse_var(&lookup, "AUX_TICK_MS", DEFAULT_TICK.as_millis() as u64)?;
        let bind = parse_var(&lookup, "AUX_BIND", SocketAddr::from(([0, 0, 0, 0], 3000)))?;

        Ok(Self {
            serial: SerialConfig {
                path,
                baud_rate,
                parity,
            },
            link: LinkConfig {
                poll_interval_ms: (poll_ms > 0).then_some(poll_ms),
                ..LinkConfig::default()
            },
            tick: Duration::from_millis(tick_ms.max(1)),
            bind,
        })
    }
}

fn parse_var<T>(lookup: impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid {name}: {raw:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<BridgeConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BridgeConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.serial.path, "/dev/ttyUSB0");
        assert_eq!(config.serial.baud_rate, 4800);
        assert_eq!(config.serial.parity, ParityMode::Even);
        assert_eq!(config.link.poll_interval_ms, Some(7000));
        assert_eq!(config.tick, Duration::from_millis(5));
        assert_eq!(config.bind.port(), 3000);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("AUX_PORT", "/dev/ttyS1"),
            ("AUX_PARITY", "none"),
            ("AUX_POLL_INTERVAL_MS", "0"),
            ("AUX_BIND", "127.0.0.1:8080"),
        ])
        .unwrap();
        assert_eq!(config.serial.path, "/dev/ttyS1");
        assert_eq!(config.serial.parity, ParityMode::None);
        assert_eq!(config.link.poll_interval_ms, None);
        assert_eq!(config.bind, "127.0.0.1:8080".parse().unwrap());
    }

    #[test]
    fn test_invalid_value_is_reported() {
        let err = config(&[("AUX_BAUD", "fast")]).unwrap_err();
        assert!(err.to_string().contains("AUX_BAUD"));
    }
}
