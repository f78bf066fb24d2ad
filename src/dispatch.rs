//! Live event fan-out.
//!
//! One bounded broadcast channel carries every accepted event to all
//! connected dashboard subscribers. Sending never blocks ingestion: a
//! subscriber that falls behind the buffer loses the oldest messages
//! (`RecvError::Lagged` on its side) instead of queueing without bound.

use crate::event::LiveEvent;
use tokio::sync::broadcast;

pub const DEFAULT_LIVE_BUFFER: usize = 64;

#[derive(Clone)]
pub struct Dispatcher {
    tx: broadcast::Sender<LiveEvent>,
}

impl Dispatcher {
    pub fn new(buffer: usize) -> Self {
        let (tx, _rx) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    /// Register a live subscriber. Dropping the receiver deregisters it.
    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.tx.subscribe()
    }

    /// Best-effort broadcast. Having no subscribers is not an error.
    pub fn broadcast(&self, ev: LiveEvent) {
        let _ = self.tx.send(ev);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, IncomingEvent};

    fn live(device_id: i32) -> LiveEvent {
        let ev = IncomingEvent {
            device_id,
            kind: EventKind::Trigger,
            kind_label: "trigger".to_string(),
            trap_count: None,
            battery_voltage: None,
            route_hops: None,
            device_timestamp: Some(1),
            gateway_time: None,
            mac_address: None,
        };
        LiveEvent::from_event(&ev, 1_000)
    }

    #[tokio::test]
    async fn every_subscriber_receives_each_event() {
        let dispatcher = Dispatcher::new(8);
        let mut a = dispatcher.subscribe();
        let mut b = dispatcher.subscribe();

        dispatcher.broadcast(live(1));
        dispatcher.broadcast(live(2));

        assert_eq!(a.recv().await.unwrap().node_id, 1);
        assert_eq!(a.recv().await.unwrap().node_id, 2);
        assert_eq!(b.recv().await.unwrap().node_id, 1);
        assert_eq!(b.recv().await.unwrap().node_id, 2);
    }

    #[tokio::test]
    async fn broadcasting_without_subscribers_is_fine() {
        let dispatcher = Dispatcher::new(8);
        dispatcher.broadcast(live(1));
        assert_eq!(dispatcher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_instead_of_blocking() {
        let dispatcher = Dispatcher::new(2);
        let mut slow = dispatcher.subscribe();

        for id in 1..=5 {
            dispatcher.broadcast(live(id));
        }

        // The first recv reports the lag, then only the newest buffered
        // events are delivered.
        match slow.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert_eq!(missed, 3),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(slow.recv().await.unwrap().node_id, 4);
        assert_eq!(slow.recv().await.unwrap().node_id, 5);
    }

    #[tokio::test]
    async fn dropped_subscriber_deregisters() {
        let dispatcher = Dispatcher::new(8);
        let rx = dispatcher.subscribe();
        assert_eq!(dispatcher.subscriber_count(), 1);
        drop(rx);
        assert_eq!(dispatcher.subscriber_count(), 0);
        dispatcher.broadcast(live(1));
    }
}
