use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "gavel-relay",
    author,
    version,
    about = "Real-time notification relay for the auction platform"
)]
pub struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "GAVEL_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:8090")]
    listen_addr: String,

    /// Redis connection URI shared by every relay instance. When unset
    /// the relay runs on an in-memory bus and must be the only instance.
    #[arg(long, env = "GAVEL_RELAY_REDIS_URL")]
    redis_url: Option<String>,

    /// Bus channel events travel on.
    #[arg(long, env = "GAVEL_RELAY_BUS_CHANNEL", default_value = "gavel:events")]
    bus_channel: String,

    /// Outbound queue capacity per connection.
    #[arg(long, env = "GAVEL_RELAY_QUEUE_CAPACITY", default_value_t = 32)]
    queue_capacity: usize,

    /// Maximum buffered events per key in the replay window.
    #[arg(long, env = "GAVEL_RELAY_REPLAY_CAPACITY", default_value_t = 256)]
    replay_capacity: usize,

    /// Replay window age limit in seconds.
    #[arg(long, env = "GAVEL_RELAY_REPLAY_TTL_SECS", default_value_t = 900)]
    replay_ttl_secs: u64,

    /// Idle timeout after which a quiet connection is swept.
    #[arg(long, env = "GAVEL_RELAY_IDLE_TIMEOUT_SECS", default_value_t = 600)]
    idle_timeout_secs: u64,

    /// Interval between idle sweeps.
    #[arg(long, env = "GAVEL_RELAY_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    sweep_interval_secs: u64,

    /// Interval between SSE keep-alive comments.
    #[arg(long, env = "GAVEL_RELAY_KEEP_ALIVE_SECS", default_value_t = 15)]
    keep_alive_secs: u64,

    /// How long after the shutdown signal open streams may keep
    /// draining before they are closed.
    #[arg(long, env = "GAVEL_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub bus_channel: String,
    pub queue_capacity: usize,
    pub replay_capacity: usize,
    pub replay_ttl: Duration,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub keep_alive: Duration,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        // A zero-capacity connection queue cannot even be constructed.
        ensure!(
            cli.queue_capacity > 0,
            "queue capacity must be at least 1 (got {})",
            cli.queue_capacity
        );
        Ok(RelayConfig {
            listen_addr,
            redis_url: cli.redis_url,
            bus_channel: cli.bus_channel,
            queue_capacity: cli.queue_capacity,
            replay_capacity: cli.replay_capacity,
            replay_ttl: Duration::from_secs(cli.replay_ttl_secs),
            idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
            sweep_interval: Duration::from_secs(cli.sweep_interval_secs),
            keep_alive: Duration::from_secs(cli.keep_alive_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<RelayConfig> {
        let mut argv = vec!["gavel-relay"];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv)?;
        RelayConfig::try_from(cli)
    }

    #[test]
    fn defaults_produce_a_valid_config() {
        let config = parse(&[]).expect("defaults parse");
        assert_eq!(config.listen_addr.port(), 8090);
        assert_eq!(config.queue_capacity, 32);
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
    }

    #[test]
    fn zero_queue_capacity_is_rejected() {
        let err = parse(&["--queue-capacity", "0"]).unwrap_err();
        assert!(err.to_string().contains("queue capacity"));
    }

    #[test]
    fn bad_listen_address_is_rejected() {
        assert!(parse(&["--listen-addr", "not-an-addr"]).is_err());
    }
}

