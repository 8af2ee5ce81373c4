//! Newline-delimited JSON messages exchanged between the CLI and the cache host.
//!
//! Every request line is answered by exactly one response line, except `listen`,
//! which switches the connection into a one-way stream of `event` responses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Size {
        cache: String,
    },
    Get {
        cache: String,
        key: String,
    },
    PutAll {
        cache: String,
        entries: BTreeMap<String, Value>,
    },
    KeySet {
        cache: String,
    },
    Aggregate {
        cache: String,
        filter: Filter,
        aggregator: Aggregator,
    },
    InvokeAll {
        cache: String,
        filter: Filter,
        processor: Processor,
    },
    Invoke {
        cache: String,
        key: String,
        processor: Processor,
    },
    Clear {
        cache: String,
    },
    Listen {
        cache: String,
    },
}

impl Request {
    pub fn cache(&self) -> &str {
        match self {
            Request::Size { cache }
            | Request::Get { cache, .. }
            | Request::PutAll { cache, .. }
            | Request::KeySet { cache }
            | Request::Aggregate { cache, .. }
            | Request::InvokeAll { cache, .. }
            | Request::Invoke { cache, .. }
            | Request::Clear { cache }
            | Request::Listen { cache } => cache,
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Request::PutAll { .. }
                | Request::InvokeAll { .. }
                | Request::Invoke { .. }
                | Request::Clear { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Size { size: usize },
    Value { value: Option<Value> },
    Ack,
    Keys { keys: Vec<String> },
    Aggregate { result: Value },
    Invoked { results: BTreeMap<String, Value> },
    Listening,
    Event { event: MapEvent },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    Always,
    Equal { field: String, value: Value },
}

impl Filter {
    pub fn equal(field: &str, value: impl Into<Value>) -> Self {
        Filter::Equal {
            field: field.to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Aggregator {
    Count,
    Distinct {
        field: String,
    },
    Sum {
        field: String,
    },
    /// Folds trades into a `TradeSummary` using the named quantity and price fields.
    Summary {
        quantity: String,
        price: String,
    },
    Group {
        by: String,
        aggregator: Box<Aggregator>,
    },
}

impl Aggregator {
    pub fn distinct(field: &str) -> Self {
        Aggregator::Distinct {
            field: field.to_string(),
        }
    }

    pub fn group(by: &str, aggregator: Aggregator) -> Self {
        Aggregator::Group {
            by: by.to_string(),
            aggregator: Box::new(aggregator),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Processor {
    Multiply {
        field: String,
        factor: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        floor: Option<f64>,
    },
    Divide {
        field: String,
        divisor: f64,
    },
}

impl Processor {
    pub fn multiply(field: &str, factor: f64) -> Self {
        Processor::Multiply {
            field: field.to_string(),
            factor,
            floor: None,
        }
    }

    pub fn multiply_with_floor(field: &str, factor: f64, floor: f64) -> Self {
        Processor::Multiply {
            field: field.to_string(),
            factor,
            floor: Some(floor),
        }
    }

    pub fn divide(field: &str, divisor: f64) -> Self {
        Processor::Divide {
            field: field.to_string(),
            divisor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapEventKind {
    Inserted,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEvent {
    pub cache: String,
    pub key: String,
    pub kind: MapEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
}

/// Serialise a message as one protocol line, trailing newline included.
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<Vec<u8>> {
    let mut payload = serde_json::to_vec(message)?;
    payload.push(b'\n');
    Ok(payload)
}
