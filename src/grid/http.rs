use std::convert::Infallible;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::chart;
use crate::constants::{PRICE_CACHE, TRADE_CACHE};
use crate::logging::{self, current_timestamp_ms};
use crate::model::{ChartData, Price, Trade};
use crate::session::Session;

use super::{seed, Grid, ShutdownSignal};

type HttpError = (StatusCode, String);

#[derive(Clone)]
pub(crate) struct HttpState {
    session: Session<Grid>,
    positions: usize,
    shutdown: watch::Receiver<ShutdownSignal>,
}

pub(crate) fn router(state: HttpState) -> Router {
    Router::new()
        .route("/service/chart-data/:update_prices", get(chart_data))
        .route("/service/developer/insert/:count", get(insert_positions))
        .route("/service/developer/:command", get(developer_command))
        .route("/service/events/subscribe", get(subscribe_prices))
        .with_state(state)
}

pub(crate) async fn run_http_server(
    addr: SocketAddr,
    session: Session<Grid>,
    positions: usize,
    shutdown: watch::Receiver<ShutdownSignal>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind http endpoint at {addr}"))?;

    logging::info(
        "http.bind",
        "HTTP endpoint listening",
        json!({ "addr": addr.to_string() }),
    );

    let state = HttpState {
        session,
        positions,
        shutdown: shutdown.clone(),
    };

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown_requested(shutdown))
        .await
        .context("http server terminated with error")?;

    logging::info_simple("http.stop", "HTTP endpoint stopped");
    Ok(())
}

async fn shutdown_requested(mut shutdown: watch::Receiver<ShutdownSignal>) {
    while shutdown.changed().await.is_ok() {
        if !matches!(*shutdown.borrow(), ShutdownSignal::None) {
            return;
        }
    }
}

fn internal_error(event: &str, err: anyhow::Error) -> HttpError {
    logging::warn(event, "HTTP request failed", json!({ "error": format!("{err:#}") }));
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

async fn chart_data(
    State(state): State<HttpState>,
    Path(update_prices): Path<bool>,
) -> Result<Json<ChartData>, HttpError> {
    chart::chart_data(&state.session, update_prices)
        .await
        .map(Json)
        .map_err(|err| internal_error("http.chart_data_failed", err))
}

async fn insert_positions(
    State(state): State<HttpState>,
    Path(count): Path<usize>,
) -> Result<StatusCode, HttpError> {
    create_positions(&state.session, count)
        .await
        .map(|_| StatusCode::OK)
        .map_err(|err| internal_error("http.insert_failed", err))
}

/// `populate` adds the configured number of positions, `clear` empties the
/// trade cache. Anything else is a 404.
async fn developer_command(
    State(state): State<HttpState>,
    Path(command): Path<String>,
) -> Result<StatusCode, HttpError> {
    let outcome = match command.as_str() {
        "populate" => create_positions(&state.session, state.positions).await,
        "clear" => state.session.cache::<Trade>(TRADE_CACHE).clear().await,
        _ => return Ok(StatusCode::NOT_FOUND),
    };
    outcome
        .map(|_| StatusCode::OK)
        .map_err(|err| internal_error("http.developer_failed", err))
}

async fn create_positions(session: &Session<Grid>, count: usize) -> Result<()> {
    seed::ensure_prices(session).await?;
    seed::create_positions(session, count).await?;
    Ok(())
}

/// Server-sent events: one `begin` event, then a `priceUpdate` carrying the new
/// price for every update to the Price cache, until the host shuts down.
async fn subscribe_prices(
    State(state): State<HttpState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, HttpError> {
    let listener = state
        .session
        .cache::<Price>(PRICE_CACHE)
        .listen()
        .await
        .map_err(|err| internal_error("http.subscribe_failed", err))?;

    let begin = Event::default()
        .event("begin")
        .data(current_timestamp_ms().to_string());

    let updates = stream::unfold(listener, |mut listener| async move {
        loop {
            match listener.next_update().await? {
                Ok(update) => match Event::default().event("priceUpdate").json_data(&update.new) {
                    Ok(event) => return Some((Ok::<_, Infallible>(event), listener)),
                    Err(err) => logging::warn(
                        "http.event_encode_failed",
                        "Skipping price event",
                        json!({ "error": err.to_string() }),
                    ),
                },
                Err(err) => logging::warn(
                    "http.event_decode_failed",
                    "Skipping price event",
                    json!({ "error": format!("{err:#}") }),
                ),
            }
        }
    });

    let events = stream::once(async move { Ok::<_, Infallible>(begin) })
        .chain(updates)
        .take_until(shutdown_requested(state.shutdown));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
