//! Runtime configuration
//!
//! `HubConfig` holds the delivery and liveness policy shared by the hub and
//! every connection. `ServerConfig` is the command-line surface of the
//! binary; every flag can also be set through its environment variable.

use std::time::Duration;

use clap::Parser;

use crate::auth::StaticTokenVerifier;
use crate::error::AppError;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Delivery, liveness and reaping policy
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Bound of each connection's outbound queue
    pub send_queue_capacity: usize,
    /// Period of liveness probes sent by the write pump
    pub ping_interval: Duration,
    /// Read deadline, measured from the last liveness signal
    pub pong_wait: Duration,
    /// Upper bound on a single frame write
    pub write_wait: Duration,
    /// Period of the reaper sweep
    pub reaper_interval: Duration,
    /// Liveness age after which the reaper closes a connection
    pub stale_after: Duration,
    /// Largest inbound frame accepted
    pub max_message_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        let ping_interval = Duration::from_secs(30);
        Self {
            send_queue_capacity: 256,
            ping_interval,
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            reaper_interval: Duration::from_secs(30),
            stale_after: ping_interval * 2,
            max_message_size: 512 * 1024,
        }
    }
}

/// Command-line configuration for the hub server
#[derive(Debug, Clone, Parser)]
#[command(name = "collab_hub", version, about = "Real-time WebSocket connection hub")]
pub struct ServerConfig {
    /// Address to listen on
    #[arg(long, env = "HUB_BIND", default_value = DEFAULT_ADDR)]
    pub bind: String,

    /// Outbound queue capacity per connection
    #[arg(long, env = "HUB_QUEUE_CAPACITY", default_value_t = 256)]
    pub queue_capacity: usize,

    /// Seconds between liveness probes
    #[arg(long, env = "HUB_PING_INTERVAL_SECS", default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Seconds to wait for a probe response before dropping the peer
    #[arg(long, env = "HUB_PONG_WAIT_SECS", default_value_t = 60)]
    pub pong_wait_secs: u64,

    /// Seconds allowed for a single frame write
    #[arg(long, env = "HUB_WRITE_WAIT_SECS", default_value_t = 10)]
    pub write_wait_secs: u64,

    /// Seconds between reaper sweeps
    #[arg(long, env = "HUB_REAPER_INTERVAL_SECS", default_value_t = 30)]
    pub reaper_interval_secs: u64,

    /// A connection is stale after this many probe intervals without liveness
    #[arg(long, env = "HUB_STALE_MULTIPLIER", default_value_t = 2)]
    pub stale_multiplier: u32,

    /// Largest inbound frame in bytes
    #[arg(long, env = "HUB_MAX_MESSAGE_BYTES", default_value_t = 512 * 1024)]
    pub max_message_bytes: usize,

    /// Accepted tokens, comma separated `token=user[:session]`
    #[arg(long, env = "HUB_TOKENS", default_value = "")]
    pub tokens: String,
}

impl ServerConfig {
    /// Build the hub policy, rejecting values that would make the hub unusable
    pub fn hub_config(&self) -> Result<HubConfig, AppError> {
        if self.queue_capacity == 0 {
            return Err(AppError::Config("queue capacity must be positive".into()));
        }
        if self.ping_interval_secs == 0 || self.reaper_interval_secs == 0 {
            return Err(AppError::Config("intervals must be positive".into()));
        }
        if self.pong_wait_secs <= self.ping_interval_secs {
            return Err(AppError::Config(
                "pong wait must exceed the ping interval".into(),
            ));
        }
        // one interval is not enough slack for a probe answered late
        if self.stale_multiplier < 2 {
            return Err(AppError::Config(
                "stale multiplier must be at least 2".into(),
            ));
        }
        let ping_interval = Duration::from_secs(self.ping_interval_secs);
        Ok(HubConfig {
            send_queue_capacity: self.queue_capacity,
            ping_interval,
            pong_wait: Duration::from_secs(self.pong_wait_secs),
            write_wait: Duration::from_secs(self.write_wait_secs),
            reaper_interval: Duration::from_secs(self.reaper_interval_secs),
            stale_after: ping_interval * self.stale_multiplier,
            max_message_size: self.max_message_bytes,
        })
    }

    pub fn verifier(&self) -> Result<StaticTokenVerifier, AppError> {
        StaticTokenVerifier::parse(&self.tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_hub_config() {
        let cfg = ServerConfig::parse_from(["collab_hub"]);
        let hub = cfg.hub_config().unwrap();
        let default = HubConfig::default();

        assert_eq!(cfg.bind, DEFAULT_ADDR);
        assert_eq!(hub.send_queue_capacity, default.send_queue_capacity);
        assert_eq!(hub.stale_after, default.stale_after);
        assert_eq!(hub.pong_wait, default.pong_wait);
    }

    #[test]
    fn test_stale_after_scales_with_ping_interval() {
        let cfg = ServerConfig::parse_from([
            "collab_hub",
            "--ping-interval-secs",
            "10",
            "--pong-wait-secs",
            "25",
            "--stale-multiplier",
            "3",
        ]);
        let hub = cfg.hub_config().unwrap();
        assert_eq!(hub.stale_after, Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let cfg = ServerConfig::parse_from(["collab_hub", "--queue-capacity", "0"]);
        assert!(matches!(cfg.hub_config(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_rejects_single_interval_staleness() {
        let cfg = ServerConfig::parse_from(["collab_hub", "--stale-multiplier", "1"]);
        assert!(matches!(cfg.hub_config(), Err(AppError::Config(_))));

        let cfg = ServerConfig::parse_from(["collab_hub", "--stale-multiplier", "2"]);
        assert!(cfg.hub_config().unwrap().stale_after > cfg.hub_config().unwrap().ping_interval);
    }
}
