use std::{str::FromStr, time::Duration};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub url: String,
    pub exchange: String,
    pub subscribe_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    pub poll_failure_threshold: u32,
    pub presence_stale_after: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    /// In-memory store when absent.
    pub database: Option<DatabaseConfig>,
    /// In-process bus when absent.
    pub amqp: Option<AmqpConfig>,
    pub push_webhook_url: Option<String>,
    pub sync: SyncConfig,
    pub delivery_fee_cents: i64,
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_var<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|value| {
            value
                .parse()
                .with_context(|| format!("Invalid value for {}: {:?}", key, value))
        })
        .transpose()
}

pub fn load() -> Result<Config> {
    let server = ServerConfig {
        host: var("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
        port: parse_var("SERVER_PORT")?.unwrap_or(3000),
    };

    let database = var("DATABASE_URL").map(|url| DatabaseConfig { url });

    let subscribe_timeout =
        Duration::from_secs(parse_var("AMQP_SUBSCRIBE_TIMEOUT_SECS")?.unwrap_or(10));
    let amqp = var("AMQP_URL").map(|url| AmqpConfig {
        url,
        exchange: var("AMQP_EXCHANGE").unwrap_or_else(|| "orders.realtime".to_string()),
        subscribe_timeout,
    });

    let sync = SyncConfig {
        poll_interval: Duration::from_secs(parse_var("POLL_INTERVAL_SECS")?.unwrap_or(15)),
        poll_failure_threshold: parse_var("POLL_FAILURE_THRESHOLD")?.unwrap_or(3),
        presence_stale_after: parse_var::<u64>("PRESENCE_STALE_AFTER_SECS")?
            .map(Duration::from_secs),
    };

    Ok(Config {
        server,
        database,
        amqp,
        push_webhook_url: var("PUSH_WEBHOOK_URL"),
        sync,
        delivery_fee_cents: parse_var("DELIVERY_FEE_CENTS")?.unwrap_or(500),
    })
}
