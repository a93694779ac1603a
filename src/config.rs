use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::engine::{ConflictPolicy, EngineConfig};
use crate::lifecycle::{BusinessHours, ServiceSettings};

/// roomd: room booking conflict and availability server.
///
/// Speaks the PostgreSQL wire protocol. Every flag can also be set through
/// its `ROOMD_*` environment variable.
#[derive(Parser, Debug, Clone)]
#[command(name = "roomd", version, about, long_about = None)]
pub struct Config {
    #[arg(long, env = "ROOMD_PORT", default_value_t = 5433)]
    pub port: u16,

    #[arg(long, env = "ROOMD_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Directory holding the booking WAL.
    #[arg(long, env = "ROOMD_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Cleartext password expected from every client.
    #[arg(long, env = "ROOMD_PASSWORD", default_value = "roomd", hide_env_values = true)]
    pub password: String,

    #[arg(long, env = "ROOMD_MAX_CONNECTIONS", default_value_t = 256)]
    pub max_connections: usize,

    /// WAL appends between background compactions.
    #[arg(long, env = "ROOMD_COMPACT_THRESHOLD", default_value_t = 1000)]
    pub compact_threshold: u64,

    /// Serve Prometheus metrics on this port.
    #[arg(long, env = "ROOMD_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    #[arg(long, env = "ROOMD_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, env = "ROOMD_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// JSON file with locations and user roles. Defaults to `<data_dir>/seed.json`.
    #[arg(long, env = "ROOMD_SEED")]
    pub seed: Option<PathBuf>,

    /// `pending-blocks` or `approved-only`.
    #[arg(long, env = "ROOMD_CONFLICT_POLICY", default_value = "pending-blocks")]
    pub conflict_policy: ConflictPolicy,

    /// Accept bookings that start in the past.
    #[arg(long, env = "ROOMD_ALLOW_PAST")]
    pub allow_past: bool,

    /// Give up waiting for a location lock after this many milliseconds.
    #[arg(long, env = "ROOMD_LOCK_TIMEOUT_MS", default_value_t = 5000)]
    pub lock_timeout_ms: u64,

    /// Daily window used for slot listings, `HH:MM-HH:MM` UTC.
    #[arg(long, env = "ROOMD_BUSINESS_HOURS", default_value = "08:00-18:00")]
    pub business_hours: BusinessHours,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }

    pub fn seed_path(&self) -> PathBuf {
        self.seed
            .clone()
            .unwrap_or_else(|| self.data_dir.join("seed.json"))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            conflict_policy: self.conflict_policy,
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
        }
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            allow_past_bookings: self.allow_past,
            business_hours: self.business_hours,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HOUR_MS;

    #[test]
    fn flags_override_defaults() {
        let config = Config::try_parse_from([
            "roomd",
            "--port",
            "6000",
            "--data-dir",
            "/var/lib/roomd",
            "--conflict-policy",
            "approved-only",
            "--allow-past",
            "--lock-timeout-ms",
            "250",
            "--business-hours",
            "07:30-21:00",
        ])
        .unwrap();

        assert_eq!(config.listen_addr(), format!("{}:6000", config.bind));
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/roomd/bookings.wal"));
        assert_eq!(config.seed_path(), PathBuf::from("/var/lib/roomd/seed.json"));

        let engine = config.engine_config();
        assert_eq!(engine.conflict_policy, ConflictPolicy::ApprovedOnly);
        assert_eq!(engine.lock_timeout, Duration::from_millis(250));

        let settings = config.service_settings();
        assert!(settings.allow_past_bookings);
        assert_eq!(settings.business_hours.open, 7 * HOUR_MS + HOUR_MS / 2);
        assert_eq!(settings.business_hours.close, 21 * HOUR_MS);
    }

    #[test]
    fn explicit_seed_path_wins() {
        let config = Config::try_parse_from(["roomd", "--seed", "/etc/roomd/campus.json"]).unwrap();
        assert_eq!(config.seed_path(), PathBuf::from("/etc/roomd/campus.json"));
    }

    #[test]
    fn bad_policy_is_rejected() {
        assert!(Config::try_parse_from(["roomd", "--conflict-policy", "first-come"]).is_err());
        assert!(Config::try_parse_from(["roomd", "--business-hours", "late"]).is_err());
    }
}
