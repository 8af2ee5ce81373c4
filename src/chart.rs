use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::constants::{PRICE_CACHE, TRADE_CACHE};
use crate::grid::ticker::update_random_price;
use crate::logging::current_timestamp_ms;
use crate::model::{ChartData, Price, Trade, TradeSummary};
use crate::protocol::{Aggregator, Filter};
use crate::session::{Session, Transport};

/// Build the dashboard snapshot: per-symbol totals, current prices and the
/// purchase valuation of every position. When `update_prices` is set and trades
/// exist, one price is ticked first, outside the aggregation timer.
pub async fn chart_data<T: Transport>(session: &Session<T>, update_prices: bool) -> Result<ChartData> {
    let trades = session.cache::<Trade>(TRADE_CACHE);
    let prices = session.cache::<Price>(PRICE_CACHE);

    let position_count = trades.size().await?;
    if update_prices && position_count > 0 {
        let mut rng = StdRng::from_entropy();
        update_random_price(&prices, &mut rng).await?;
    }

    let started = Instant::now();

    let summaries: BTreeMap<String, TradeSummary> = trades
        .aggregate(
            Filter::Always,
            Aggregator::group(
                Trade::SYMBOL,
                Aggregator::Summary {
                    quantity: Trade::QUANTITY.to_string(),
                    price: Trade::PRICE.to_string(),
                },
            ),
        )
        .await?;

    let mut symbol_price = BTreeMap::new();
    for symbol in prices.key_set().await? {
        if let Some(quote) = prices.get(&symbol).await? {
            symbol_price.insert(symbol, quote.price);
        }
    }

    let aggregation_duration = started.elapsed().as_millis();

    Ok(ChartData {
        instant: current_timestamp_ms(),
        aggregation_duration,
        position_count,
        symbols: summaries.keys().cloned().collect(),
        symbol_frequency: summaries
            .iter()
            .map(|(symbol, summary)| (symbol.clone(), summary.frequency))
            .collect(),
        symbol_count: summaries
            .iter()
            .map(|(symbol, summary)| (symbol.clone(), summary.count))
            .collect(),
        original_valuation: summaries.values().map(|summary| summary.purchase_value).sum(),
        symbol_price,
    })
}
