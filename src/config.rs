//! Environment-driven configuration, loaded once at startup via dotenvy.

use crate::dispatch::DEFAULT_LIVE_BUFFER;
use crate::notify::{NotificationPolicy, DEFAULT_MIN_INTERVAL};
use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub topic: String,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub mqtt: MqttConfig,
    pub http_host: String,
    pub http_port: u16,
    pub live_buffer: usize,
    pub notify_on_trigger: bool,
    pub notify_on_low_battery: bool,
    pub notify_on_status: bool,
    pub notify_min_interval: Duration,
    /// Devices silent for longer than this are swept offline. Zero
    /// disables the sweep.
    pub offline_after: Duration,
    pub telegram: Option<TelegramConfig>,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("invalid {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

fn flag_or(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => bail!("invalid {key}: {raw} (expected true or false)"),
        },
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let telegram = match (env::var("TELEGRAM_BOT_TOKEN"), env::var("TELEGRAM_CHAT_ID")) {
            (Ok(bot_token), Ok(chat_id)) => Some(TelegramConfig { bot_token, chat_id }),
            _ => None,
        };

        Ok(Self {
            database_url: var_or("DATABASE_URL", "trap_events.db"),
            mqtt: MqttConfig {
                broker: var_or("MQTT_BROKER", "localhost"),
                port: parse_var("MQTT_PORT", 1883)?,
                topic: var_or("MQTT_TOPIC", "trap/#"),
            },
            http_host: var_or("HTTP_HOST", "127.0.0.1"),
            http_port: parse_var("HTTP_PORT", 8081)?,
            live_buffer: parse_var("LIVE_BUFFER", DEFAULT_LIVE_BUFFER)?,
            notify_on_trigger: flag_or("NOTIFY_ON_TRIGGER", true)?,
            notify_on_low_battery: flag_or("NOTIFY_ON_LOW_BATTERY", true)?,
            notify_on_status: flag_or("NOTIFY_ON_STATUS", false)?,
            notify_min_interval: Duration::from_secs(parse_var(
                "NOTIFY_MIN_INTERVAL_SECS",
                DEFAULT_MIN_INTERVAL.as_secs(),
            )?),
            offline_after: Duration::from_secs(parse_var("OFFLINE_AFTER_SECS", 0)?),
            telegram,
        })
    }

    pub fn notification_policy(&self) -> NotificationPolicy {
        NotificationPolicy {
            on_trigger: self.notify_on_trigger,
            on_low_battery: self.notify_on_low_battery,
            on_status: self.notify_on_status,
            min_interval: self.notify_min_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own env key; tests run in parallel threads.

    #[test]
    fn flag_defaults_when_unset() {
        assert!(flag_or("TRAP_TEST_FLAG_UNSET", true).unwrap());
        assert!(!flag_or("TRAP_TEST_FLAG_UNSET", false).unwrap());
    }

    #[test]
    fn flag_accepts_common_spellings() {
        env::set_var("TRAP_TEST_FLAG_TRUE", "YES");
        assert!(flag_or("TRAP_TEST_FLAG_TRUE", false).unwrap());

        env::set_var("TRAP_TEST_FLAG_FALSE", "0");
        assert!(!flag_or("TRAP_TEST_FLAG_FALSE", true).unwrap());
    }

    #[test]
    fn flag_rejects_unrecognized_values() {
        env::set_var("TRAP_TEST_FLAG_BAD", "on");
        let err = flag_or("TRAP_TEST_FLAG_BAD", true).unwrap_err();
        assert!(err.to_string().contains("TRAP_TEST_FLAG_BAD"));
    }

    #[test]
    fn numeric_vars_reject_garbage() {
        env::set_var("TRAP_TEST_PORT_BAD", "not-a-port");
        assert!(parse_var::<u16>("TRAP_TEST_PORT_BAD", 1883).is_err());
        assert_eq!(parse_var::<u16>("TRAP_TEST_PORT_UNSET", 1883).unwrap(), 1883);
    }
}
