use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{INITIAL_PRICE, SYMBOLS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub symbol: String,
    pub quantity: i64,
    pub price: f64,
}

impl Trade {
    pub const SYMBOL: &'static str = "symbol";
    pub const QUANTITY: &'static str = "quantity";
    pub const PRICE: &'static str = "price";

    pub fn new(symbol: impl Into<String>, quantity: i64, price: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            quantity,
            price,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub symbol: String,
    pub price: f64,
}

impl Price {
    pub const SYMBOL: &'static str = "symbol";
    pub const PRICE: &'static str = "price";

    pub fn new(symbol: impl Into<String>, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
        }
    }
}

pub fn default_prices() -> Vec<Price> {
    SYMBOLS
        .iter()
        .map(|symbol| Price::new(*symbol, INITIAL_PRICE))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceChange {
    pub symbol: String,
    pub old: f64,
    pub new: f64,
}

impl PriceChange {
    pub fn change(&self) -> f64 {
        self.new - self.old
    }
}

impl fmt::Display for PriceChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Price changed for {}, new=${:.2}, old=${:.2}, change=${:.2}",
            self.symbol,
            self.new,
            self.old,
            self.change()
        )
    }
}

/// Per-group totals produced by the `summary` aggregator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeSummary {
    pub frequency: i64,
    pub count: u64,
    pub purchase_value: f64,
}

impl TradeSummary {
    pub fn add(&mut self, quantity: i64, purchase_value: f64) {
        self.frequency += quantity;
        self.count += 1;
        self.purchase_value += purchase_value;
    }

    pub fn combine(mut self, other: TradeSummary) -> Self {
        self.frequency += other.frequency;
        self.count += other.count;
        self.purchase_value += other.purchase_value;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartData {
    pub instant: u128,
    pub aggregation_duration: u128,
    pub position_count: usize,
    pub symbols: BTreeSet<String>,
    pub symbol_frequency: BTreeMap<String, i64>,
    pub symbol_count: BTreeMap<String, u64>,
    pub symbol_price: BTreeMap<String, f64>,
    pub original_valuation: f64,
}
