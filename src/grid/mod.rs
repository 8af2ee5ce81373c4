//! Single-process host for the demo's named caches.
//!
//! Caches are created on first use and hold JSON documents keyed by string.
//! Every mutation is published on the cache's broadcast channel so listeners
//! see inserts and updates in the order they were applied.

mod functions;
mod http;
pub mod seed;
mod server;
pub mod ticker;

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use serde_json::{json, Value};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc, watch, RwLock};

use crate::constants::{DEFAULT_POSITIONS, PRICE_TICK_MS, SOCKET_PATH};
use crate::logging;
use crate::protocol::{MapEvent, MapEventKind, Request, Response};
use crate::session::{EventStream, Session, Transport};

const EVENT_CHANNEL_CAPACITY: usize = 4096;

#[derive(Clone, Debug)]
pub struct GridConfig {
    pub socket_path: PathBuf,
    pub http_addr: Option<SocketAddr>,
    pub price_tick: Option<Duration>,
    pub seed_data: bool,
    pub initial_positions: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(SOCKET_PATH),
            http_addr: None,
            price_tick: Some(Duration::from_millis(PRICE_TICK_MS)),
            seed_data: true,
            initial_positions: DEFAULT_POSITIONS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ShutdownSignal {
    None,
    Graceful,
    Immediate,
}

pub struct CacheStore {
    name: String,
    entries: RwLock<BTreeMap<String, Value>>,
    events: broadcast::Sender<MapEvent>,
}

impl CacheStore {
    fn new(name: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            name: name.to_string(),
            entries: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MapEvent> {
        self.events.subscribe()
    }

    fn publish(&self, key: &str, kind: MapEventKind, old: Option<Value>, new: Option<Value>) {
        let _ = self.events.send(MapEvent {
            cache: self.name.clone(),
            key: key.to_string(),
            kind,
            old,
            new,
        });
    }
}

#[derive(Default)]
pub struct Grid {
    caches: RwLock<HashMap<String, Arc<CacheStore>>>,
}

impl Grid {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn cache(&self, name: &str) -> Arc<CacheStore> {
        if let Some(store) = self.caches.read().await.get(name) {
            return Arc::clone(store);
        }
        let mut guard = self.caches.write().await;
        Arc::clone(
            guard
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CacheStore::new(name))),
        )
    }

    pub async fn handle(&self, request: Request) -> Result<Response> {
        let store = self.cache(request.cache()).await;

        let response = match request {
            Request::Size { .. } => Response::Size {
                size: store.entries.read().await.len(),
            },
            Request::Get { key, .. } => Response::Value {
                value: store.entries.read().await.get(&key).cloned(),
            },
            Request::PutAll { entries, .. } => {
                let mut guard = store.entries.write().await;
                for (key, value) in entries {
                    match guard.insert(key.clone(), value.clone()) {
                        Some(old) => {
                            store.publish(&key, MapEventKind::Updated, Some(old), Some(value))
                        }
                        None => store.publish(&key, MapEventKind::Inserted, None, Some(value)),
                    }
                }
                Response::Ack
            }
            Request::KeySet { .. } => Response::Keys {
                keys: store.entries.read().await.keys().cloned().collect(),
            },
            Request::Aggregate {
                filter, aggregator, ..
            } => {
                let guard = store.entries.read().await;
                let matched: Vec<&Value> = guard
                    .par_iter()
                    .filter(|(_, value)| filter.matches(value))
                    .map(|(_, value)| value)
                    .collect();
                Response::Aggregate {
                    result: aggregator.aggregate(&matched)?,
                }
            }
            Request::InvokeAll {
                filter, processor, ..
            } => {
                let mut guard = store.entries.write().await;
                // Process copies first so a failure part-way leaves the cache untouched.
                let mut staged = Vec::new();
                for (key, entry) in guard.iter().filter(|(_, entry)| filter.matches(entry)) {
                    let mut updated = entry.clone();
                    let result = processor
                        .process(&mut updated)
                        .with_context(|| format!("processor failed on `{key}` in {}", store.name))?;
                    staged.push((key.clone(), updated, result));
                }

                let mut results = BTreeMap::new();
                for (key, updated, result) in staged {
                    let old = guard.insert(key.clone(), updated.clone());
                    store.publish(&key, MapEventKind::Updated, old, Some(updated));
                    results.insert(key, result);
                }
                Response::Invoked { results }
            }
            Request::Invoke { key, processor, .. } => {
                let mut guard = store.entries.write().await;
                let mut results = BTreeMap::new();
                if let Some(entry) = guard.get_mut(&key) {
                    let old = entry.clone();
                    let result = processor
                        .process(entry)
                        .with_context(|| format!("processor failed on `{key}` in {}", store.name))?;
                    store.publish(&key, MapEventKind::Updated, Some(old), Some(entry.clone()));
                    results.insert(key, result);
                }
                Response::Invoked { results }
            }
            Request::Clear { .. } => {
                let mut guard = store.entries.write().await;
                for (key, old) in std::mem::take(&mut *guard) {
                    store.publish(&key, MapEventKind::Deleted, Some(old), None);
                }
                Response::Ack
            }
            Request::Listen { cache } => {
                bail!("listen on {cache} needs a dedicated connection");
            }
        };

        Ok(response)
    }
}

impl Transport for Grid {
    async fn request(&self, request: Request) -> Result<Response> {
        self.handle(request).await
    }

    async fn subscribe(&self, cache: &str) -> Result<EventStream> {
        let mut receiver = self.cache(cache).await.subscribe();
        let (sender, events) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if sender.send(event).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        logging::warn(
                            "grid.listener_lagged",
                            "In-process listener lagged cache events",
                            json!({ "skipped": skipped }),
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(events)
    }
}

pub async fn run_with_config(config: GridConfig) -> Result<()> {
    let config = Arc::new(config);
    let grid = Arc::new(Grid::new());
    let session = Session::from_shared(Arc::clone(&grid));

    if config.seed_data {
        seed::populate_prices(&session).await?;
        seed::create_positions(&session, config.initial_positions).await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownSignal::None);
    let signals_task = tokio::spawn(handle_signals(shutdown_tx));

    let http_future = {
        let session = session.clone();
        let shutdown = shutdown_rx.clone();
        let addr = config.http_addr;
        let positions = config.initial_positions;
        async move {
            match addr {
                Some(addr) => http::run_http_server(addr, session, positions, shutdown).await,
                None => Ok(()),
            }
        }
    };

    let run_result = tokio::try_join!(
        server::run_socket_server(Arc::clone(&config), Arc::clone(&grid), shutdown_rx.clone()),
        ticker::run_price_ticker(Arc::clone(&config), session, shutdown_rx),
        http_future,
    );

    signals_task.abort();
    let _ = signals_task.await;

    run_result?;
    Ok(())
}

async fn handle_signals(shutdown_tx: watch::Sender<ShutdownSignal>) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            logging::info(
                "signal.received",
                "SIGTERM received, initiating graceful shutdown",
                json!({ "signal": "SIGTERM" })
            );
            let _ = shutdown_tx.send(ShutdownSignal::Graceful);
        }
        _ = sigint.recv() => {
            logging::warn(
                "signal.received",
                "SIGINT received, forcing immediate shutdown",
                json!({ "signal": "SIGINT" })
            );
            let _ = shutdown_tx.send(ShutdownSignal::Immediate);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Aggregator, Filter, Processor};

    fn put(cache: &str, entries: Value) -> Request {
        let entries = entries
            .as_object()
            .map(|map| map.clone().into_iter().collect())
            .unwrap_or_default();
        Request::PutAll {
            cache: cache.into(),
            entries,
        }
    }

    #[tokio::test]
    async fn caches_are_created_on_first_use() {
        let grid = Grid::new();
        let response = grid
            .handle(Request::Size {
                cache: "Trade".into(),
            })
            .await
            .expect("size");
        assert_eq!(response, Response::Size { size: 0 });
    }

    #[tokio::test]
    async fn put_all_publishes_insert_then_update() {
        let grid = Grid::new();
        let mut events = grid.cache("Price").await.subscribe();

        grid.handle(put("Price", json!({ "ORCL": { "symbol": "ORCL", "price": 20.0 } })))
            .await
            .expect("insert");
        grid.handle(put("Price", json!({ "ORCL": { "symbol": "ORCL", "price": 21.0 } })))
            .await
            .expect("update");

        let inserted = events.recv().await.expect("inserted");
        assert_eq!(inserted.kind, MapEventKind::Inserted);
        assert_eq!(inserted.old, None);

        let updated = events.recv().await.expect("updated");
        assert_eq!(updated.kind, MapEventKind::Updated);
        assert_eq!(updated.old, Some(json!({ "symbol": "ORCL", "price": 20.0 })));
        assert_eq!(updated.new, Some(json!({ "symbol": "ORCL", "price": 21.0 })));
    }

    #[tokio::test]
    async fn invoke_all_only_touches_matching_entries() {
        let grid = Grid::new();
        grid.handle(put(
            "Trade",
            json!({
                "a": { "symbol": "ORCL", "quantity": 2 },
                "b": { "symbol": "MSFT", "quantity": 3 },
            }),
        ))
        .await
        .expect("seed");

        let response = grid
            .handle(Request::InvokeAll {
                cache: "Trade".into(),
                filter: Filter::equal("symbol", "ORCL"),
                processor: Processor::multiply("quantity", 5.0),
            })
            .await
            .expect("invoke_all");
        let Response::Invoked { results } = response else {
            panic!("unexpected response {response:?}");
        };
        assert_eq!(results.len(), 1);
        assert_eq!(results["a"], json!(10));

        let untouched = grid
            .handle(Request::Get {
                cache: "Trade".into(),
                key: "b".into(),
            })
            .await
            .expect("get");
        assert_eq!(
            untouched,
            Response::Value {
                value: Some(json!({ "symbol": "MSFT", "quantity": 3 }))
            }
        );
    }

    #[tokio::test]
    async fn invoke_on_missing_key_is_a_no_op() {
        let grid = Grid::new();
        let response = grid
            .handle(Request::Invoke {
                cache: "Price".into(),
                key: "NOPE".into(),
                processor: Processor::multiply("price", 0.5),
            })
            .await
            .expect("invoke");
        assert_eq!(
            response,
            Response::Invoked {
                results: BTreeMap::new()
            }
        );
    }

    #[tokio::test]
    async fn aggregate_applies_filter_first() {
        let grid = Grid::new();
        grid.handle(put(
            "Trade",
            json!({
                "a": { "symbol": "ORCL" },
                "b": { "symbol": "ORCL" },
                "c": { "symbol": "EMC" },
            }),
        ))
        .await
        .expect("seed");

        let response = grid
            .handle(Request::Aggregate {
                cache: "Trade".into(),
                filter: Filter::equal("symbol", "ORCL"),
                aggregator: Aggregator::Count,
            })
            .await
            .expect("aggregate");
        assert_eq!(response, Response::Aggregate { result: json!(2) });
    }

    #[tokio::test]
    async fn invoke_all_failure_leaves_every_entry_untouched() {
        let grid = Grid::new();
        grid.handle(put(
            "Trade",
            json!({
                "a": { "symbol": "ORCL", "quantity": 2 },
                "b": { "symbol": "ORCL", "quantity": "many" },
            }),
        ))
        .await
        .expect("seed");
        let mut events = grid.cache("Trade").await.subscribe();

        let result = grid
            .handle(Request::InvokeAll {
                cache: "Trade".into(),
                filter: Filter::equal("symbol", "ORCL"),
                processor: Processor::multiply("quantity", 3.0),
            })
            .await;
        assert!(result.is_err());

        let first = grid
            .handle(Request::Get {
                cache: "Trade".into(),
                key: "a".into(),
            })
            .await
            .expect("get");
        assert_eq!(
            first,
            Response::Value {
                value: Some(json!({ "symbol": "ORCL", "quantity": 2 }))
            }
        );
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn clear_empties_the_cache_and_publishes_deletes() {
        let grid = Grid::new();
        grid.handle(put("Trade", json!({ "a": { "symbol": "EMC" } })))
            .await
            .expect("seed");
        let mut events = grid.cache("Trade").await.subscribe();

        let response = grid
            .handle(Request::Clear {
                cache: "Trade".into(),
            })
            .await
            .expect("clear");
        assert_eq!(response, Response::Ack);

        let size = grid
            .handle(Request::Size {
                cache: "Trade".into(),
            })
            .await
            .expect("size");
        assert_eq!(size, Response::Size { size: 0 });

        let deleted = events.recv().await.expect("deleted");
        assert_eq!(deleted.kind, MapEventKind::Deleted);
        assert_eq!(deleted.key, "a");
        assert_eq!(deleted.new, None);
    }

    #[tokio::test]
    async fn listen_is_rejected_on_request_path() {
        let grid = Grid::new();
        let result = grid
            .handle(Request::Listen {
                cache: "Price".into(),
            })
            .await;
        assert!(result.is_err());
    }
}
