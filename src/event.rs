//! Wire payload decoding for device events.
//!
//! Devices publish JSON on `trap/#`; only `node_id` and `event_type` are
//! mandatory. Everything else decodes to `None` when absent so a missing
//! reading is never confused with a real zero.

use serde::{Deserialize, Serialize};

/// Event classes reported by trap nodes. The bus may carry codes we do not
/// know about; those land in `Other` and are stored but never aggregated
/// or alerted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StatusPing,
    Trigger,
    LowBattery,
    Other(i32),
}

impl EventKind {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => EventKind::StatusPing,
            1 => EventKind::Trigger,
            2 => EventKind::LowBattery,
            other => EventKind::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            EventKind::StatusPing => 0,
            EventKind::Trigger => 1,
            EventKind::LowBattery => 2,
            EventKind::Other(code) => code,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EventKind::StatusPing => "status",
            EventKind::Trigger => "trigger",
            EventKind::LowBattery => "low_battery",
            EventKind::Other(_) => "unknown",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Raw field set as published by the nodes.
#[derive(Debug, Deserialize)]
struct WirePayload {
    node_id: i32,
    event_type: i32,
    event_type_str: Option<String>,
    trap_count: Option<i32>,
    battery_voltage: Option<f32>,
    route_hops: Option<i32>,
    timestamp: Option<i64>,
    gateway_time: Option<i64>,
    mac_address: Option<String>,
}

/// A decoded event, not yet persisted.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub device_id: i32,
    pub kind: EventKind,
    /// Display label. Taken from the wire when present, otherwise derived
    /// from `kind`; not authoritative.
    pub kind_label: String,
    pub trap_count: Option<i32>,
    pub battery_voltage: Option<f32>,
    pub route_hops: Option<i32>,
    /// Device-local clock. Together with `device_id` this is the natural
    /// key for deduplication; events without it are never deduplicated.
    pub device_timestamp: Option<i64>,
    pub gateway_time: Option<i64>,
    pub mac_address: Option<String>,
}

pub fn decode(payload: &[u8]) -> Result<IncomingEvent, DecodeError> {
    let raw: WirePayload = serde_json::from_slice(payload)?;
    let kind = EventKind::from_code(raw.event_type);
    let kind_label = raw
        .event_type_str
        .unwrap_or_else(|| kind.label().to_string());

    Ok(IncomingEvent {
        device_id: raw.node_id,
        kind,
        kind_label,
        trap_count: raw.trap_count,
        battery_voltage: raw.battery_voltage,
        route_hops: raw.route_hops,
        device_timestamp: raw.timestamp,
        gateway_time: raw.gateway_time,
        mac_address: raw.mac_address,
    })
}

/// Outbound copy of an accepted event, pushed to live dashboard
/// subscribers. Field names mirror the inbound payload.
#[derive(Debug, Clone, Serialize)]
pub struct LiveEvent {
    pub node_id: i32,
    pub event_type: i32,
    pub event_type_str: String,
    pub trap_count: Option<i32>,
    pub battery_voltage: Option<f32>,
    pub route_hops: Option<i32>,
    pub timestamp: Option<i64>,
    pub gateway_time: Option<i64>,
    pub mac_address: Option<String>,
    pub received_at: i64,
}

impl LiveEvent {
    pub fn from_event(ev: &IncomingEvent, received_at: i64) -> Self {
        Self {
            node_id: ev.device_id,
            event_type: ev.kind.code(),
            event_type_str: ev.kind_label.clone(),
            trap_count: ev.trap_count,
            battery_voltage: ev.battery_voltage,
            route_hops: ev.route_hops,
            timestamp: ev.device_timestamp,
            gateway_time: ev.gateway_time,
            mac_address: ev.mac_address.clone(),
            received_at,
        }
    }
}
