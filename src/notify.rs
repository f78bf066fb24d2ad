//! Outbound alerting: per-kind enable flags, a per (device, kind)
//! minimum-interval throttle, alert text formatting and the Telegram
//! delivery sink.

use crate::event::{EventKind, IncomingEvent};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct NotificationPolicy {
    pub on_trigger: bool,
    pub on_low_battery: bool,
    pub on_status: bool,
    pub min_interval: Duration,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self {
            on_trigger: true,
            on_low_battery: true,
            on_status: false,
            min_interval: DEFAULT_MIN_INTERVAL,
        }
    }
}

/// Rate limiter for outbound alerts. State is process-local and lost on
/// restart; a fresh process may alert immediately.
pub struct NotificationGate {
    policy: NotificationPolicy,
    last_sent: Mutex<HashMap<(i32, i32), Instant>>,
}

impl NotificationGate {
    pub fn new(policy: NotificationPolicy) -> Self {
        Self {
            policy,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    fn enabled(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Trigger => self.policy.on_trigger,
            EventKind::LowBattery => self.policy.on_low_battery,
            EventKind::StatusPing => self.policy.on_status,
            EventKind::Other(_) => false,
        }
    }

    /// Decide whether to alert for this (device, kind) pair, recording the
    /// decision time on `true`. The window anchors to the last sent
    /// notification; suppressed calls do not reset it.
    pub fn should_notify(&self, device_id: i32, kind: EventKind) -> bool {
        self.should_notify_at(device_id, kind, Instant::now())
    }

    fn should_notify_at(&self, device_id: i32, kind: EventKind, now: Instant) -> bool {
        if !self.enabled(kind) {
            return false;
        }

        let Ok(mut last_sent) = self.last_sent.lock() else {
            return false;
        };
        let key = (device_id, kind.code());
        if let Some(sent_at) = last_sent.get(&key) {
            if now.duration_since(*sent_at) < self.policy.min_interval {
                log::debug!(
                    "rate limit: suppressing {} alert for node {}",
                    kind.label(),
                    device_id
                );
                return false;
            }
        }
        last_sent.insert(key, now);
        true
    }
}

/// Human-readable alert text for an accepted event.
pub fn format_alert(ev: &IncomingEvent) -> String {
    let voltage = ev
        .battery_voltage
        .map(|v| format!("{v:.2}V"))
        .unwrap_or_else(|| "unknown".to_string());

    match ev.kind {
        EventKind::Trigger => format!(
            "Trap triggered! Node {}, total catches: {}, battery: {}",
            ev.device_id,
            ev.trap_count
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            voltage
        ),
        EventKind::LowBattery => format!(
            "Low battery warning: node {} at {}, replace soon",
            ev.device_id, voltage
        ),
        EventKind::StatusPing => format!(
            "Status update: node {}, battery {}, {} catches",
            ev.device_id,
            voltage,
            ev.trap_count.unwrap_or(0)
        ),
        EventKind::Other(code) => {
            format!("Node {} reported event type {}", ev.device_id, code)
        }
    }
}

/// Outbound send capability. Delivery failures are the caller's to log;
/// the gate's timestamp is never rolled back.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;
}

/// Telegram bot API sink.
pub struct TelegramSink {
    http: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramSink {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token,
            chat_id,
        }
    }
}

#[async_trait]
impl AlertSink for TelegramSink {
    async fn send(&self, text: &str) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": text,
            }))
            .send()
            .await
            .context("telegram request failed")?;

        if !response.status().is_success() {
            bail!("telegram API returned {}", response.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(min_interval: Duration) -> NotificationGate {
        NotificationGate::new(NotificationPolicy {
            min_interval,
            ..NotificationPolicy::default()
        })
    }

    #[test]
    fn window_allows_one_alert_per_interval() {
        // min_interval = 10s; requests at t=0 (sent), t=5 (suppressed),
        // t=11 (sent). Exactly 2 sends.
        let gate = gate(Duration::from_secs(10));
        let t0 = Instant::now();

        assert!(gate.should_notify_at(3, EventKind::Trigger, t0));
        assert!(!gate.should_notify_at(3, EventKind::Trigger, t0 + Duration::from_secs(5)));
        assert!(gate.should_notify_at(3, EventKind::Trigger, t0 + Duration::from_secs(11)));
    }

    #[test]
    fn suppressed_calls_do_not_reset_the_window() {
        let gate = gate(Duration::from_secs(10));
        let t0 = Instant::now();

        assert!(gate.should_notify_at(1, EventKind::Trigger, t0));
        assert!(!gate.should_notify_at(1, EventKind::Trigger, t0 + Duration::from_secs(5)));
        assert!(!gate.should_notify_at(1, EventKind::Trigger, t0 + Duration::from_secs(9)));
        // 10s after the last *sent* alert, not after the last attempt.
        assert!(gate.should_notify_at(1, EventKind::Trigger, t0 + Duration::from_secs(10)));
    }

    #[test]
    fn pairs_are_rate_limited_independently() {
        let gate = gate(Duration::from_secs(10));
        let t0 = Instant::now();

        assert!(gate.should_notify_at(1, EventKind::Trigger, t0));
        assert!(gate.should_notify_at(2, EventKind::Trigger, t0));
        assert!(gate.should_notify_at(1, EventKind::LowBattery, t0));
        assert!(!gate.should_notify_at(1, EventKind::Trigger, t0));
    }

    #[test]
    fn disabled_kinds_never_notify() {
        let gate = NotificationGate::new(NotificationPolicy {
            on_trigger: false,
            on_low_battery: true,
            on_status: false,
            min_interval: Duration::from_secs(0),
        });
        let t0 = Instant::now();

        for i in 0..5 {
            assert!(!gate.should_notify_at(1, EventKind::Trigger, t0 + Duration::from_secs(i)));
        }
        assert!(!gate.should_notify_at(1, EventKind::StatusPing, t0));
        assert!(!gate.should_notify_at(1, EventKind::Other(9), t0));
        assert!(gate.should_notify_at(1, EventKind::LowBattery, t0));
    }

    #[test]
    fn status_pings_are_disabled_by_default() {
        let gate = NotificationGate::new(NotificationPolicy::default());
        assert!(!gate.should_notify_at(1, EventKind::StatusPing, Instant::now()));
    }

    #[test]
    fn alert_text_mentions_the_node_and_reading() {
        let ev = IncomingEvent {
            device_id: 3,
            kind: EventKind::LowBattery,
            kind_label: "low_battery".to_string(),
            trap_count: None,
            battery_voltage: Some(2.1),
            route_hops: None,
            device_timestamp: Some(1),
            gateway_time: None,
            mac_address: None,
        };
        let text = format_alert(&ev);
        assert!(text.contains("node 3"));
        assert!(text.contains("2.10V"));
    }
}
