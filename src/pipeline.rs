//! The ingestion unit of work: decode, persist + aggregate atomically,
//! then fan out. One explicitly constructed instance owns the whole
//! chain; there are no module-level singletons.

use crate::db::{Db, InsertOutcome};
use crate::dispatch::Dispatcher;
use crate::event::{self, IncomingEvent, LiveEvent};
use crate::notify::{self, AlertSink, NotificationGate};
use crate::utils;
use log::{debug, error, info};
use std::sync::{Arc, Mutex};

pub struct Pipeline {
    db: Arc<Mutex<Db>>,
    dispatcher: Dispatcher,
    gate: NotificationGate,
    sink: Option<Arc<dyn AlertSink>>,
}

impl Pipeline {
    pub fn new(
        db: Arc<Mutex<Db>>,
        dispatcher: Dispatcher,
        gate: NotificationGate,
        sink: Option<Arc<dyn AlertSink>>,
    ) -> Self {
        Self {
            db,
            dispatcher,
            gate,
            sink,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Process one raw bus message. Failures here only ever drop this
    /// message; the subscription loop is never affected.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) {
        let ev = match event::decode(payload) {
            Ok(ev) => ev,
            Err(e) => {
                error!("dropping malformed message on {topic}: {e}");
                return;
            }
        };

        let received_at = utils::now_millis();
        let outcome = match self.db.lock() {
            Ok(mut db) => db.record_event(&ev, received_at),
            Err(_) => {
                error!("event store lock poisoned, dropping message");
                return;
            }
        };

        match outcome {
            Ok(InsertOutcome::Inserted) => {}
            Ok(InsertOutcome::Duplicate) => {
                debug!(
                    "duplicate event from node {} (device_timestamp {:?}), skipped",
                    ev.device_id, ev.device_timestamp
                );
                return;
            }
            Err(e) => {
                // Not acknowledged here; the bus redelivers.
                error!("failed to persist event from node {}: {e:#}", ev.device_id);
                return;
            }
        }

        info!("event logged: node {}, type {}", ev.device_id, ev.kind_label);

        // Fan-out happens strictly after the transaction committed and
        // outside the store lock.
        self.dispatcher
            .broadcast(LiveEvent::from_event(&ev, received_at));
        self.maybe_notify(&ev).await;
    }

    async fn maybe_notify(&self, ev: &IncomingEvent) {
        let Some(sink) = &self.sink else {
            return;
        };
        if !self.gate.should_notify(ev.device_id, ev.kind) {
            return;
        }
        // The gate already committed its timestamp; a failed send is
        // logged and not retried.
        let text = notify::format_alert(ev);
        if let Err(e) = sink.send(&text).await {
            error!("alert delivery failed for node {}: {e:#}", ev.device_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationPolicy;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::time::Duration;

    struct RecordingSink {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn send(&self, text: &str) -> Result<()> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AlertSink for FailingSink {
        async fn send(&self, _text: &str) -> Result<()> {
            anyhow::bail!("channel down")
        }
    }

    fn pipeline_with_sink(sink: Option<Arc<dyn AlertSink>>) -> (Arc<Mutex<Db>>, Pipeline) {
        let mut db = Db::connect(":memory:").unwrap();
        db.init_schema().unwrap();
        let db = Arc::new(Mutex::new(db));
        let pipeline = Pipeline::new(
            db.clone(),
            Dispatcher::new(16),
            NotificationGate::new(NotificationPolicy::default()),
            sink,
        );
        (db, pipeline)
    }

    #[tokio::test]
    async fn end_to_end_dedup_broadcast_and_alert() {
        let sink = Arc::new(RecordingSink {
            sent: Mutex::new(Vec::new()),
        });
        let (db, pipeline) = pipeline_with_sink(Some(sink.clone()));
        let mut live = pipeline.dispatcher().subscribe();

        let trigger = |ts: i64| {
            format!(r#"{{"node_id": 1, "event_type": 1, "trap_count": 2, "timestamp": {ts}}}"#)
        };

        pipeline.handle_message("trap/1", trigger(100).as_bytes()).await;
        pipeline.handle_message("trap/1", trigger(100).as_bytes()).await; // redelivery
        pipeline.handle_message("trap/1", trigger(200).as_bytes()).await;

        // Two stored events, two broadcasts, one alert (the second trigger
        // is inside the rate-limit window).
        {
            let mut db = db.lock().unwrap();
            assert_eq!(db.recent_events_for_device(1, 10).unwrap().len(), 2);
            let devices = db.devices().unwrap();
            assert_eq!(devices[0].total_triggers, 2);
        }
        assert_eq!(live.recv().await.unwrap().timestamp, Some(100));
        assert_eq!(live.recv().await.unwrap().timestamp, Some(200));
        assert!(live.try_recv().is_err());
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped_without_side_effects() {
        let (db, pipeline) = pipeline_with_sink(None);
        let mut live = pipeline.dispatcher().subscribe();

        pipeline.handle_message("trap/1", b"not json").await;
        pipeline.handle_message("trap/1", br#"{"event_type": 1}"#).await;

        assert!(db.lock().unwrap().recent_events(10).unwrap().is_empty());
        assert!(live.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_failure_does_not_fail_ingestion() {
        let (db, pipeline) = pipeline_with_sink(Some(Arc::new(FailingSink)));
        pipeline
            .handle_message(
                "trap/5",
                br#"{"node_id": 5, "event_type": 1, "timestamp": 1}"#,
            )
            .await;
        assert_eq!(db.lock().unwrap().recent_events(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicates_are_not_rebroadcast() {
        let (_db, pipeline) = pipeline_with_sink(None);
        let mut live = pipeline.dispatcher().subscribe();
        let payload = br#"{"node_id": 2, "event_type": 0, "timestamp": 7}"#;

        pipeline.handle_message("trap/2", payload).await;
        pipeline.handle_message("trap/2", payload).await;

        assert_eq!(live.recv().await.unwrap().node_id, 2);
        assert!(live.try_recv().is_err());
    }

    #[tokio::test]
    async fn rate_limit_wait_allows_later_alert() {
        let sink = Arc::new(RecordingSink {
            sent: Mutex::new(Vec::new()),
        });
        let mut db = Db::connect(":memory:").unwrap();
        db.init_schema().unwrap();
        let pipeline = Pipeline::new(
            Arc::new(Mutex::new(db)),
            Dispatcher::new(16),
            NotificationGate::new(NotificationPolicy {
                min_interval: Duration::from_millis(20),
                ..NotificationPolicy::default()
            }),
            Some(sink.clone()),
        );

        let payload = |ts: i64| {
            format!(r#"{{"node_id": 3, "event_type": 1, "timestamp": {ts}}}"#)
        };
        pipeline.handle_message("trap/3", payload(1).as_bytes()).await;
        pipeline.handle_message("trap/3", payload(2).as_bytes()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        pipeline.handle_message("trap/3", payload(3).as_bytes()).await;

        assert_eq!(sink.sent.lock().unwrap().len(), 2);
    }
}
