use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod db;
mod dispatch;
mod event;
mod ingest;
mod notify;
mod pipeline;
mod schema;
mod utils;

use config::Config;
use db::Db;
use dispatch::Dispatcher;
use notify::{AlertSink, NotificationGate, TelegramSink};
use pipeline::Pipeline;

#[actix_web::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = Config::from_env()?;
    let mut db = Db::connect(&config.database_url)
        .with_context(|| format!("cannot open database at {}", config.database_url))?;
    // A store we could not initialize must abort startup, not run degraded.
    db.init_schema().context("storage initialization failed")?;
    let db = Arc::new(Mutex::new(db));

    let dispatcher = Dispatcher::new(config.live_buffer);
    let sink: Option<Arc<dyn AlertSink>> = config
        .telegram
        .clone()
        .map(|t| Arc::new(TelegramSink::new(t.bot_token, t.chat_id)) as Arc<dyn AlertSink>);
    let pipeline = Arc::new(Pipeline::new(
        db.clone(),
        dispatcher.clone(),
        NotificationGate::new(config.notification_policy()),
        sink.clone(),
    ));

    info!(
        "trap-monitor starting: broker {}:{}, topic {}, database {}",
        config.mqtt.broker, config.mqtt.port, config.mqtt.topic, config.database_url
    );

    if let Some(sink) = &sink {
        if let Err(e) = sink.send("Trap monitor system online").await {
            error!("startup notice failed: {e:#}");
        }
    }

    let cancel = CancellationToken::new();

    let ingest_task = actix_web::rt::spawn(ingest::run(
        pipeline.clone(),
        config.mqtt.clone(),
        cancel.clone(),
    ));

    if !config.offline_after.is_zero() {
        let db = db.clone();
        let cancel = cancel.clone();
        let offline_after_ms = config.offline_after.as_millis() as i64;
        actix_web::rt::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Ok(mut db) = db.lock() {
                            match db.mark_stale_offline(utils::now_millis() - offline_after_ms) {
                                Ok(0) => {}
                                Ok(n) => info!("liveness sweep: {n} devices marked offline"),
                                Err(e) => warn!("liveness sweep failed: {e:#}"),
                            }
                        }
                    }
                }
            }
        });
    }

    {
        let cancel = cancel.clone();
        actix_web::rt::spawn(async move {
            let _ = signal::ctrl_c().await;
            info!("shutdown signal received");
            cancel.cancel();
        });
    }

    let server = api::new_http_server(
        db.clone(),
        dispatcher.clone(),
        config.http_host.clone(),
        config.http_port,
    );
    tokio::select! {
        res = server => {
            if let Err(e) = res {
                error!("HTTP server error: {e}");
            }
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }

    let _ = ingest_task.await;
    if let Some(sink) = &sink {
        if let Err(e) = sink.send("Trap monitor system offline").await {
            error!("shutdown notice failed: {e:#}");
        }
    }
    info!("trap-monitor stopped");
    Ok(())
}
