use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;

use crate::constants::{MAX_TRADE_QUANTITY, PRICE_CACHE, SYMBOLS, TRADE_BATCH_SIZE, TRADE_CACHE};
use crate::logging;
use crate::model::{default_prices, Price, Trade};
use crate::session::{Session, Transport};

pub async fn populate_prices<T: Transport>(session: &Session<T>) -> Result<()> {
    let prices = session.cache::<Price>(PRICE_CACHE);
    let entries: BTreeMap<String, Price> = default_prices()
        .into_iter()
        .map(|price| (price.symbol.clone(), price))
        .collect();
    prices.put_all(&entries).await?;

    logging::info(
        "seed.prices",
        "Populated demo prices",
        json!({ "symbols": entries.keys().collect::<Vec<_>>() }),
    );
    Ok(())
}

/// Reseed the prices unless every demo symbol is already priced.
pub async fn ensure_prices<T: Transport>(session: &Session<T>) -> Result<()> {
    let priced = session.cache::<Price>(PRICE_CACHE).size().await?;
    if priced != SYMBOLS.len() {
        populate_prices(session).await?;
    }
    Ok(())
}

/// Fill the trade cache with `count` random positions across the priced symbols.
pub async fn create_positions<T: Transport>(session: &Session<T>, count: usize) -> Result<usize> {
    let prices = session.cache::<Price>(PRICE_CACHE);
    let trades = session.cache::<Trade>(TRADE_CACHE);

    let mut quotes = Vec::new();
    for symbol in prices.key_set().await? {
        let quote = prices
            .get(&symbol)
            .await?
            .with_context(|| format!("price for {symbol} vanished while seeding"))?;
        quotes.push(quote);
    }
    if quotes.is_empty() && count > 0 {
        bail!("cannot create positions without prices");
    }

    let mut rng = StdRng::from_entropy();
    let mut remaining = count;
    while remaining > 0 {
        let batch_len = remaining.min(TRADE_BATCH_SIZE);
        let mut batch = BTreeMap::new();
        for _ in 0..batch_len {
            let Some(quote) = quotes.choose(&mut rng) else {
                break;
            };
            let trade = Trade::new(
                quote.symbol.clone(),
                rng.gen_range(1..=MAX_TRADE_QUANTITY),
                quote.price,
            );
            batch.insert(trade.id.clone(), trade);
        }
        trades.put_all(&batch).await?;
        remaining -= batch_len;
    }

    let size = trades.size().await?;
    logging::info(
        "seed.positions",
        "Created demo positions",
        json!({ "created": count, "cache_size": size }),
    );
    Ok(size)
}
