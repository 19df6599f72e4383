/// Node configuration from `HAVEN_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use haven_transfer::{DEFAULT_CHUNK_SIZE, GroupConfig, TransferConfig};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub db_path: PathBuf,
    pub output_dir: PathBuf,
    pub transfer: TransferConfig,
    pub group: GroupConfig,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let db_path = lookup("HAVEN_DB_PATH").unwrap_or_else(|| "haven-transfers.db".into());
        let output_dir = lookup("HAVEN_OUTPUT_DIR").unwrap_or_else(|| "received".into());

        let mut transfer = TransferConfig::default();
        transfer.chunk_size = parse(&lookup, "HAVEN_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
        transfer.max_retries = parse(&lookup, "HAVEN_MAX_RETRIES", transfer.max_retries)?;
        transfer.ack_timeout = Duration::from_millis(parse(
            &lookup,
            "HAVEN_ACK_TIMEOUT_MS",
            transfer.ack_timeout.as_millis() as u64,
        )?);
        transfer.high_water = parse(&lookup, "HAVEN_HIGH_WATER", transfer.high_water)?;
        transfer.low_water = parse(&lookup, "HAVEN_LOW_WATER", transfer.low_water)?;
        transfer.max_file_size = parse(&lookup, "HAVEN_MAX_FILE_SIZE", transfer.max_file_size)?;
        transfer.max_memory_file_size = parse(
            &lookup,
            "HAVEN_MAX_MEMORY_FILE_SIZE",
            transfer.max_memory_file_size.min(transfer.max_file_size),
        )?;
        transfer.ratchet.turn_every_messages = parse(
            &lookup,
            "HAVEN_RATCHET_TURN_MESSAGES",
            transfer.ratchet.turn_every_messages,
        )?;
        transfer.ratchet.turn_every = Duration::from_secs(parse(
            &lookup,
            "HAVEN_RATCHET_TURN_SECS",
            transfer.ratchet.turn_every.as_secs(),
        )?);
        transfer.ratchet.max_skip = parse(&lookup, "HAVEN_RATCHET_MAX_SKIP", transfer.ratchet.max_skip)?;
        transfer.validate()?;

        let group = GroupConfig {
            max_concurrent_sessions: parse(
                &lookup,
                "HAVEN_MAX_CONCURRENT",
                GroupConfig::default().max_concurrent_sessions,
            )?,
        };
        if group.max_concurrent_sessions == 0 {
            bail!("HAVEN_MAX_CONCURRENT must be at least 1");
        }

        Ok(Self {
            db_path: PathBuf::from(db_path),
            output_dir: PathBuf::from(output_dir),
            transfer,
            group,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = NodeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.transfer.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.group.max_concurrent_sessions, 4);
        assert_eq!(config.db_path, PathBuf::from("haven-transfers.db"));
    }

    #[test]
    fn reads_overrides() {
        let config = NodeConfig::from_lookup(lookup(&[
            ("HAVEN_CHUNK_SIZE", "1024"),
            ("HAVEN_ACK_TIMEOUT_MS", "500"),
            ("HAVEN_MAX_CONCURRENT", "2"),
            ("HAVEN_RATCHET_TURN_MESSAGES", "64"),
            ("HAVEN_MAX_FILE_SIZE", "1048576"),
        ]))
        .unwrap();
        assert_eq!(config.transfer.max_file_size, 1 << 20);
        assert_eq!(config.transfer.max_memory_file_size, 1 << 20);
        assert_eq!(config.transfer.chunk_size, 1024);
        assert_eq!(config.transfer.ack_timeout, Duration::from_millis(500));
        assert_eq!(config.group.max_concurrent_sessions, 2);
        assert_eq!(config.transfer.ratchet.turn_every_messages, 64);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(NodeConfig::from_lookup(lookup(&[("HAVEN_CHUNK_SIZE", "0")])).is_err());
        assert!(NodeConfig::from_lookup(lookup(&[("HAVEN_CHUNK_SIZE", "big")])).is_err());
        assert!(
            NodeConfig::from_lookup(lookup(&[
                ("HAVEN_HIGH_WATER", "100"),
                ("HAVEN_LOW_WATER", "200"),
            ]))
            .is_err()
        );
        assert!(NodeConfig::from_lookup(lookup(&[("HAVEN_MAX_CONCURRENT", "0")])).is_err());
    }
}
