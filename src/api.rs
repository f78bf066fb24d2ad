//! Read-only query surface for the dashboard, plus the SSE live feed.

use std::{
    convert::Infallible,
    io,
    sync::{Arc, Mutex},
};

use actix_cors::Cors;
use actix_web::{
    get,
    http::header,
    web::{self, Data},
    App, HttpResponse, HttpServer, Responder,
};
use log::warn;
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};

use crate::db::{DailyStatistic, Db};
use crate::dispatch::Dispatcher;
use crate::utils;

const MAX_LIMIT: i64 = 500;

fn clamp_limit(limit: Option<i64>, default: i64) -> i64 {
    limit.unwrap_or(default).clamp(1, MAX_LIMIT)
}

fn query_failed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "query failed")
}

#[get("/")]
async fn hello(_db: web::Data<Arc<Mutex<Db>>>) -> impl Responder {
    HttpResponse::Ok().body("trap-monitor")
}

#[get("/api/nodes")]
async fn api_nodes(db: web::Data<Arc<Mutex<Db>>>) -> io::Result<impl Responder> {
    if let Ok(mut db) = db.lock() {
        if let Ok(res) = db.devices() {
            return Ok(web::Json(res));
        }
    }
    Err(query_failed())
}

#[derive(serde::Deserialize, Debug)]
struct EventsQuery {
    limit: Option<i64>,
}

#[get("/api/events")]
async fn api_events(
    query: web::Query<EventsQuery>,
    db: web::Data<Arc<Mutex<Db>>>,
) -> io::Result<impl Responder> {
    if let Ok(mut db) = db.lock() {
        if let Ok(res) = db.recent_events(clamp_limit(query.limit, 50)) {
            return Ok(web::Json(res));
        }
    }
    Err(query_failed())
}

#[get("/api/node/{node_id}/events")]
async fn api_node_events(
    path: web::Path<i32>,
    query: web::Query<EventsQuery>,
    db: web::Data<Arc<Mutex<Db>>>,
) -> io::Result<impl Responder> {
    if let Ok(mut db) = db.lock() {
        if let Ok(res) = db.recent_events_for_device(*path, clamp_limit(query.limit, 20)) {
            return Ok(web::Json(res));
        }
    }
    Err(query_failed())
}

#[derive(serde::Deserialize, Debug)]
struct StatisticsQuery {
    days: Option<i64>,
}

#[derive(serde::Serialize, Debug)]
struct StatisticsResponse {
    daily: Vec<DailyStatistic>,
    total_triggers: i64,
    active_nodes: i64,
    triggers_24h: i64,
}

#[get("/api/statistics")]
async fn api_statistics(
    query: web::Query<StatisticsQuery>,
    db: web::Data<Arc<Mutex<Db>>>,
) -> io::Result<impl Responder> {
    let days = query.days.unwrap_or(7).clamp(1, 365);
    let day_cutoff = utils::now_millis() - 86_400_000;

    let Ok(mut db) = db.lock() else {
        return Err(query_failed());
    };
    let response = (|| -> anyhow::Result<StatisticsResponse> {
        Ok(StatisticsResponse {
            daily: db.daily_statistics(days)?,
            total_triggers: db.total_triggers()?,
            active_nodes: db.active_device_count()?,
            triggers_24h: db.triggers_since(day_cutoff)?,
        })
    })();

    match response {
        Ok(res) => Ok(web::Json(res)),
        Err(_) => Err(query_failed()),
    }
}

#[get("/api/battery")]
async fn api_battery(db: web::Data<Arc<Mutex<Db>>>) -> io::Result<impl Responder> {
    if let Ok(mut db) = db.lock() {
        if let Ok(res) = db.battery_ranking() {
            return Ok(web::Json(res));
        }
    }
    Err(query_failed())
}

/// Server-sent events stream of accepted events. Lagged clients silently
/// lose the oldest buffered events rather than slowing ingestion.
#[get("/api/events/live")]
async fn api_events_live(dispatcher: web::Data<Dispatcher>) -> impl Responder {
    let rx = dispatcher.subscribe();
    log::debug!(
        "live feed client connected ({} subscribers)",
        dispatcher.subscriber_count()
    );
    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(ev) => serde_json::to_string(&ev)
            .ok()
            .map(|json| Ok::<_, Infallible>(web::Bytes::from(format!("data: {json}\n\n")))),
        Err(BroadcastStreamRecvError::Lagged(missed)) => {
            warn!("live feed subscriber lagged, {missed} events dropped");
            None
        }
    });

    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(stream)
}

pub async fn new_http_server(
    db: Arc<Mutex<Db>>,
    dispatcher: Dispatcher,
    host: String,
    port: u16,
) -> std::io::Result<()> {
    HttpServer::new(move || {
        App::new()
            .app_data(Data::new(db.clone()))
            .app_data(Data::new(dispatcher.clone()))
            .service(hello)
            .service(api_nodes)
            .service(api_events)
            .service(api_node_events)
            .service(api_statistics)
            .service(api_battery)
            .service(api_events_live)
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET"])
                    .allowed_headers(vec![header::AUTHORIZATION, header::ACCEPT])
                    .allowed_header(header::CONTENT_TYPE)
                    .max_age(3600),
            )
    })
    .bind((host.as_str(), port))?
    .run()
    .await
}
