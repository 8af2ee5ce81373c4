use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::{Aggregator, Filter, MapEvent, MapEventKind, Processor, Request, Response};

pub type EventStream = mpsc::UnboundedReceiver<MapEvent>;

/// Carries protocol requests to a cache host, local or remote.
pub trait Transport: Send + Sync + 'static {
    fn request(&self, request: Request) -> impl Future<Output = Result<Response>> + Send;

    fn subscribe(&self, cache: &str) -> impl Future<Output = Result<EventStream>> + Send;
}

pub struct Session<T> {
    transport: Arc<T>,
}

impl<T> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T) -> Self {
        Self::from_shared(Arc::new(transport))
    }

    pub fn from_shared(transport: Arc<T>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn cache<V>(&self, name: &str) -> NamedCache<T, V> {
        NamedCache {
            name: name.to_string(),
            transport: Arc::clone(&self.transport),
            _value: PhantomData,
        }
    }
}

/// Typed handle onto one named cache.
pub struct NamedCache<T, V> {
    name: String,
    transport: Arc<T>,
    _value: PhantomData<fn() -> V>,
}

impl<T, V> Clone for NamedCache<T, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            transport: Arc::clone(&self.transport),
            _value: PhantomData,
        }
    }
}

impl<T, V> NamedCache<T, V>
where
    T: Transport,
    V: Serialize + DeserializeOwned,
{
    pub async fn size(&self) -> Result<usize> {
        let cache = self.name.clone();
        match self.transport.request(Request::Size { cache }).await? {
            Response::Size { size } => Ok(size),
            other => unexpected(&self.name, other),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        let request = Request::Get {
            cache: self.name.clone(),
            key: key.to_string(),
        };
        match self.transport.request(request).await? {
            Response::Value { value: None } => Ok(None),
            Response::Value { value: Some(value) } => serde_json::from_value(value)
                .map(Some)
                .with_context(|| format!("failed to decode `{key}` from cache {}", self.name)),
            other => unexpected(&self.name, other),
        }
    }

    pub async fn put_all(&self, entries: &BTreeMap<String, V>) -> Result<()> {
        let mut encoded = BTreeMap::new();
        for (key, value) in entries {
            encoded.insert(key.clone(), serde_json::to_value(value)?);
        }
        let request = Request::PutAll {
            cache: self.name.clone(),
            entries: encoded,
        };
        match self.transport.request(request).await? {
            Response::Ack => Ok(()),
            other => unexpected(&self.name, other),
        }
    }

    pub async fn key_set(&self) -> Result<Vec<String>> {
        let cache = self.name.clone();
        match self.transport.request(Request::KeySet { cache }).await? {
            Response::Keys { keys } => Ok(keys),
            other => unexpected(&self.name, other),
        }
    }

    pub async fn aggregate<R: DeserializeOwned>(
        &self,
        filter: Filter,
        aggregator: Aggregator,
    ) -> Result<R> {
        let request = Request::Aggregate {
            cache: self.name.clone(),
            filter,
            aggregator,
        };
        match self.transport.request(request).await? {
            Response::Aggregate { result } => serde_json::from_value(result)
                .with_context(|| format!("failed to decode aggregate from cache {}", self.name)),
            other => unexpected(&self.name, other),
        }
    }

    pub async fn distinct(&self, field: &str) -> Result<Vec<String>> {
        self.aggregate(Filter::Always, Aggregator::distinct(field))
            .await
    }

    /// Run `processor` against every entry matching `filter`; returns the
    /// processor result per updated key.
    pub async fn invoke_all(
        &self,
        filter: Filter,
        processor: Processor,
    ) -> Result<BTreeMap<String, Value>> {
        let request = Request::InvokeAll {
            cache: self.name.clone(),
            filter,
            processor,
        };
        match self.transport.request(request).await? {
            Response::Invoked { results } => Ok(results),
            other => unexpected(&self.name, other),
        }
    }

    pub async fn invoke(&self, key: &str, processor: Processor) -> Result<Option<Value>> {
        let request = Request::Invoke {
            cache: self.name.clone(),
            key: key.to_string(),
            processor,
        };
        match self.transport.request(request).await? {
            Response::Invoked { mut results } => Ok(results.remove(key)),
            other => unexpected(&self.name, other),
        }
    }

    pub async fn clear(&self) -> Result<()> {
        let cache = self.name.clone();
        match self.transport.request(Request::Clear { cache }).await? {
            Response::Ack => Ok(()),
            other => unexpected(&self.name, other),
        }
    }

    pub async fn listen(&self) -> Result<Listener<V>> {
        let events = self.transport.subscribe(&self.name).await?;
        Ok(Listener {
            events,
            _value: PhantomData,
        })
    }
}

fn unexpected<R>(cache: &str, response: Response) -> Result<R> {
    bail!("unexpected response from cache {cache}: {response:?}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update<V> {
    pub key: String,
    pub old: V,
    pub new: V,
}

pub struct Listener<V> {
    events: EventStream,
    _value: PhantomData<fn() -> V>,
}

impl<V: DeserializeOwned> Listener<V> {
    /// Next update event, skipping inserts. `None` once the host hangs up.
    pub async fn next_update(&mut self) -> Option<Result<Update<V>>> {
        while let Some(event) = self.events.recv().await {
            if event.kind != MapEventKind::Updated {
                continue;
            }
            return Some(decode_update(event));
        }
        None
    }
}

fn decode_update<V: DeserializeOwned>(event: MapEvent) -> Result<Update<V>> {
    let (Some(old), Some(new)) = (event.old, event.new) else {
        bail!("update event for `{}` is missing a value", event.key);
    };
    Ok(Update {
        old: serde_json::from_value(old).context("decode old value")?,
        new: serde_json::from_value(new).context("decode new value")?,
        key: event.key,
    })
}
