//! SFU service configuration.
//!
//! Configuration is loaded from environment variables. The Redis URL is the
//! only sensitive field and is redacted in Debug output.

use crate::media::{WebRtcTransportOptions, WorkerSettings};
use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default signaling (WebSocket) bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3016";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default lower bound of the RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 40000;

/// Default upper bound of the RTC port range.
pub const DEFAULT_RTC_MAX_PORT: u16 = 49999;

/// Default address transports listen on.
pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";

/// Default initial outgoing bitrate (bps).
pub const DEFAULT_INITIAL_OUTGOING_BITRATE: u32 = 1_000_000;

/// Default minimum outgoing bitrate (bps).
pub const DEFAULT_MIN_OUTGOING_BITRATE: u32 = 600_000;

/// Default maximum incoming bitrate per transport (bps).
pub const DEFAULT_MAX_INCOMING_BITRATE: u32 = 1_500_000;

/// Default participant limit for rooms whose meeting record sets none.
pub const DEFAULT_MAX_PARTICIPANTS: u32 = 50;

/// Default delay between a worker death and process shutdown.
pub const DEFAULT_WORKER_DEATH_GRACE_MS: u64 = 2000;

/// Default SFU instance ID prefix.
pub const DEFAULT_SFU_ID_PREFIX: &str = "sfu";

/// SFU service configuration.
#[derive(Clone)]
pub struct Config {
    /// Unique identifier for this SFU instance.
    pub sfu_id: String,

    /// Signaling server bind address (default: "0.0.0.0:3016").
    pub bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Number of media workers. `None` means one per host CPU core.
    pub num_workers: Option<usize>,

    pub rtc_min_port: u16,
    pub rtc_max_port: u16,

    /// Address transports bind to.
    pub listen_ip: IpAddr,

    /// Public address advertised to clients, for hosts behind NAT.
    pub announced_ip: Option<String>,

    pub initial_outgoing_bitrate: u32,
    pub min_outgoing_bitrate: u32,
    pub max_incoming_bitrate: u32,

    /// Participant limit used when the meeting record does not carry one.
    pub default_max_participants: u32,

    /// Delay between a worker death and process shutdown.
    pub worker_death_grace: Duration,

    /// Emit logs as JSON lines.
    pub log_json: bool,

    /// Redis connection URL for the meeting store. `None` selects the static
    /// in-process store.
    pub redis_url: Option<SecretString>,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("sfu_id", &self.sfu_id)
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("num_workers", &self.num_workers)
            .field("rtc_min_port", &self.rtc_min_port)
            .field("rtc_max_port", &self.rtc_max_port)
            .field("listen_ip", &self.listen_ip)
            .field("announced_ip", &self.announced_ip)
            .field("initial_outgoing_bitrate", &self.initial_outgoing_bitrate)
            .field("min_outgoing_bitrate", &self.min_outgoing_bitrate)
            .field("max_incoming_bitrate", &self.max_incoming_bitrate)
            .field("default_max_participants", &self.default_max_participants)
            .field("worker_death_grace", &self.worker_death_grace)
            .field("log_json", &self.log_json)
            .field(
                "redis_url",
                &self.redis_url.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse an optional variable, failing loudly on malformed values.
fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    match vars.get(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("SFU_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SFU_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let num_workers = parse_var::<usize>(vars, "SFU_NUM_WORKERS")?;
        if num_workers == Some(0) {
            return Err(ConfigError::InvalidValue(
                "SFU_NUM_WORKERS must be at least 1".to_string(),
            ));
        }

        let rtc_min_port = parse_var(vars, "SFU_RTC_MIN_PORT")?.unwrap_or(DEFAULT_RTC_MIN_PORT);
        let rtc_max_port = parse_var(vars, "SFU_RTC_MAX_PORT")?.unwrap_or(DEFAULT_RTC_MAX_PORT);
        if rtc_min_port >= rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_RTC_MIN_PORT ({rtc_min_port}) must be below SFU_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        let listen_ip = match parse_var::<IpAddr>(vars, "SFU_LISTEN_IP")? {
            Some(ip) => ip,
            None => DEFAULT_LISTEN_IP
                .parse()
                .map_err(|_| ConfigError::InvalidValue(DEFAULT_LISTEN_IP.to_string()))?,
        };

        let announced_ip = vars
            .get("SFU_ANNOUNCED_IP")
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty());

        let initial_outgoing_bitrate = parse_var(vars, "SFU_INITIAL_OUTGOING_BITRATE")?
            .unwrap_or(DEFAULT_INITIAL_OUTGOING_BITRATE);
        let min_outgoing_bitrate =
            parse_var(vars, "SFU_MIN_OUTGOING_BITRATE")?.unwrap_or(DEFAULT_MIN_OUTGOING_BITRATE);
        let max_incoming_bitrate =
            parse_var(vars, "SFU_MAX_INCOMING_BITRATE")?.unwrap_or(DEFAULT_MAX_INCOMING_BITRATE);

        let default_max_participants = parse_var(vars, "SFU_DEFAULT_MAX_PARTICIPANTS")?
            .unwrap_or(DEFAULT_MAX_PARTICIPANTS);
        if default_max_participants == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_DEFAULT_MAX_PARTICIPANTS must be at least 1".to_string(),
            ));
        }

        let worker_death_grace = Duration::from_millis(
            parse_var(vars, "SFU_WORKER_DEATH_GRACE_MS")?.unwrap_or(DEFAULT_WORKER_DEATH_GRACE_MS),
        );

        let log_json = parse_var(vars, "SFU_LOG_JSON")?.unwrap_or(false);

        let redis_url = vars
            .get("REDIS_URL")
            .filter(|url| !url.is_empty())
            .map(|url| SecretString::from(url.clone()));

        // Generate SFU instance ID
        let sfu_id = vars.get("SFU_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SFU_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            sfu_id,
            bind_address,
            health_bind_address,
            num_workers,
            rtc_min_port,
            rtc_max_port,
            listen_ip,
            announced_ip,
            initial_outgoing_bitrate,
            min_outgoing_bitrate,
            max_incoming_bitrate,
            default_max_participants,
            worker_death_grace,
            log_json,
            redis_url,
        })
    }

    /// Settings every media worker is spawned with.
    #[must_use]
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
        }
    }

    /// Network options applied to every WebRTC transport.
    #[must_use]
    pub fn transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: self.listen_ip,
            announced_ip: self.announced_ip.clone(),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: self.initial_outgoing_bitrate,
            min_outgoing_bitrate: self.min_outgoing_bitrate,
            max_incoming_bitrate: self.max_incoming_bitrate,
        }
    }
}
