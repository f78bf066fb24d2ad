//! MQTT subscription loop.
//!
//! Connects to the broker, subscribes to the trap topic tree and feeds
//! every publish into the pipeline. Connection errors tear down the
//! session and reconnect after a short delay; cancellation is checked
//! between messages so shutdown never interrupts a unit of work.

use crate::config::MqttConfig;
use crate::pipeline::Pipeline;
use anyhow::{anyhow, Result};
use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RETRY_DELAY: Duration = Duration::from_secs(5);

pub async fn run(pipeline: Arc<Pipeline>, config: MqttConfig, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        match run_connection(&pipeline, &config, &cancel).await {
            Ok(()) => break,
            Err(e) => {
                error!("MQTT connection error: {e:#}");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }
    info!("MQTT ingest stopped");
}

async fn run_connection(
    pipeline: &Pipeline,
    config: &MqttConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut options = MqttOptions::new("trap-monitor", &config.broker, config.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(options, 100);
    client.subscribe(&config.topic, QoS::AtLeastOnce).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("cancellation received, disconnecting");
                let _ = client.disconnect().await;
                return Ok(());
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    pipeline.handle_message(&publish.topic, &publish.payload).await;
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("connected to MQTT broker, subscribed to {}", config.topic);
                }
                Ok(_) => {}
                Err(e) => return Err(anyhow!("MQTT event loop error: {e}")),
            }
        }
    }
}
