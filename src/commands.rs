use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use thiserror::Error;

use crate::cli::DemoCommand;
use crate::constants::{
    MAX_SPLIT_FACTOR, MAX_TRADE_QUANTITY, PRICE_CACHE, TRADE_BATCH_SIZE, TRADE_CACHE,
};
use crate::logging;
use crate::model::{Price, PriceChange, Trade};
use crate::protocol::{Filter, Processor};
use crate::session::{NamedCache, Session, Transport};

pub const USAGE: &str = "Usage: trade-demo command
The following commands are supported:
size        - display the cache sizes
monitor     - monitor prices
add-trades  - add random trades, specify symbol and count
stock-split - stock split, specify symbol and factor
serve       - host the Price and Trade caches";

pub fn print_usage() {
    println!("{USAGE}");
}

/// Input problems reported to the user instead of failing the process.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("count cannot be negative (got {0})")]
    NegativeCount(i64),
    #[error("factor must be between 1 and {max} (got {0})", max = MAX_SPLIT_FACTOR)]
    FactorOutOfRange(i64),
    #[error("unable to find symbol {symbol}, valid values are {}", .valid.join(", "))]
    UnknownSymbol { symbol: String, valid: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSizes {
    pub trades: usize,
    pub prices: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitReport {
    pub symbol: String,
    pub factor: i64,
    pub trades_updated: usize,
    pub old_price: f64,
    pub new_price: f64,
}

/// Run one demo verb; rejections are printed and swallowed, remote failures
/// propagate.
pub async fn run<T: Transport>(session: &Session<T>, command: DemoCommand) -> Result<()> {
    let trades = session.cache::<Trade>(TRADE_CACHE);
    let prices = session.cache::<Price>(PRICE_CACHE);

    let result = match command {
        DemoCommand::Size => size(&trades, &prices).await.map(|sizes| {
            println!("Trade cache size = {}", sizes.trades);
            println!("Price cache size = {}", sizes.prices);
        }),
        DemoCommand::Monitor(args) => monitor(&prices, args.limit).await.map(|_| ()),
        DemoCommand::AddTrades(args) => add_trades(&trades, &prices, &args.symbol, args.count)
            .await
            .map(|size| println!("Trades cache size is now {size}")),
        DemoCommand::StockSplit(args) => {
            stock_split(&trades, &prices, &args.symbol, args.factor)
                .await
                .map(|report| {
                    println!(
                        "Updated price for {} from ${:.2} to ${:.2}",
                        report.symbol, report.old_price, report.new_price
                    );
                })
        }
    };

    match result {
        Ok(()) => Ok(()),
        Err(err) => match err.downcast::<Rejection>() {
            Ok(rejection) => {
                println!("{rejection}");
                Ok(())
            }
            Err(err) => Err(err),
        },
    }
}

pub async fn size<T: Transport>(
    trades: &NamedCache<T, Trade>,
    prices: &NamedCache<T, Price>,
) -> Result<CacheSizes> {
    Ok(CacheSizes {
        trades: trades.size().await?,
        prices: prices.size().await?,
    })
}

/// Print every price update until Ctrl-C, or until `limit` changes were seen.
pub async fn monitor<T: Transport>(
    prices: &NamedCache<T, Price>,
    limit: Option<usize>,
) -> Result<usize> {
    let mut listener = prices.listen().await?;
    println!("Listening for price changes. Press CTRL-C to finish.");

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    let mut seen = 0usize;
    while limit.map_or(true, |limit| seen < limit) {
        tokio::select! {
            _ = &mut interrupted => break,
            update = listener.next_update() => {
                let update = update.context("price event stream closed by cache host")??;
                let change = PriceChange {
                    symbol: update.key,
                    old: update.old.price,
                    new: update.new.price,
                };
                println!("{change}");
                seen += 1;
            }
        }
    }

    Ok(seen)
}

pub async fn add_trades<T: Transport>(
    trades: &NamedCache<T, Trade>,
    prices: &NamedCache<T, Price>,
    symbol: &str,
    count: i64,
) -> Result<usize> {
    let count = usize::try_from(count).map_err(|_| Rejection::NegativeCount(count))?;
    ensure_symbol(prices, symbol).await?;

    let quote = prices
        .get(symbol)
        .await?
        .with_context(|| format!("no price found for {symbol}"))?;

    println!("Adding {count} random trades for {symbol}...");

    let mut rng = StdRng::from_entropy();
    let mut remaining = count;
    while remaining > 0 {
        let batch_len = remaining.min(TRADE_BATCH_SIZE);
        let batch: BTreeMap<String, Trade> = (0..batch_len)
            .map(|_| {
                let trade = Trade::new(symbol, rng.gen_range(1..=MAX_TRADE_QUANTITY), quote.price);
                (trade.id.clone(), trade)
            })
            .collect();
        trades.put_all(&batch).await?;
        remaining -= batch_len;
    }

    trades.size().await
}

#[derive(Debug, Clone, Copy)]
enum SplitStep {
    TradeQuantities,
    TradePrices,
}

/// Split `symbol` by `factor`: scale trade quantities up, then trade prices and
/// the symbol's price down. If a later step fails, the earlier ones are undone
/// in reverse order before the error is returned.
pub async fn stock_split<T: Transport>(
    trades: &NamedCache<T, Trade>,
    prices: &NamedCache<T, Price>,
    symbol: &str,
    factor: i64,
) -> Result<SplitReport> {
    if !(1..=MAX_SPLIT_FACTOR).contains(&factor) {
        return Err(Rejection::FactorOutOfRange(factor).into());
    }
    ensure_symbol(prices, symbol).await?;

    let quote = prices
        .get(symbol)
        .await?
        .with_context(|| format!("no price found for {symbol}"))?;

    println!("Splitting {symbol} using factor of {factor}...");

    let multiplier = factor as f64;
    let inverse = 1.0 / multiplier;
    let filter = Filter::equal(Trade::SYMBOL, symbol);

    let updated = trades
        .invoke_all(filter.clone(), Processor::multiply(Trade::QUANTITY, multiplier))
        .await
        .with_context(|| format!("failed to scale quantities for {symbol}"))?;
    println!("Updated quantity for {} trades", updated.len());

    let mut applied = vec![SplitStep::TradeQuantities];

    let repriced = match trades
        .invoke_all(filter.clone(), Processor::multiply(Trade::PRICE, inverse))
        .await
    {
        Ok(results) => results.len(),
        Err(err) => {
            undo_split(trades, &filter, &applied, multiplier).await;
            return Err(err.context(format!("failed to scale trade prices for {symbol}")));
        }
    };
    applied.push(SplitStep::TradePrices);
    println!("Updated price for {repriced} trades");

    let new_price = match prices
        .invoke(symbol, Processor::multiply(Price::PRICE, inverse))
        .await
        .and_then(|result| {
            result
                .and_then(|value| value.as_f64())
                .with_context(|| format!("price entry for {symbol} disappeared during the split"))
        }) {
        Ok(price) => price,
        Err(err) => {
            undo_split(trades, &filter, &applied, multiplier).await;
            return Err(err.context(format!("failed to scale price for {symbol}")));
        }
    };

    Ok(SplitReport {
        symbol: symbol.to_string(),
        factor,
        trades_updated: updated.len(),
        old_price: quote.price,
        new_price,
    })
}

async fn undo_split<T: Transport>(
    trades: &NamedCache<T, Trade>,
    filter: &Filter,
    applied: &[SplitStep],
    multiplier: f64,
) {
    for step in applied.iter().rev() {
        let processor = match step {
            SplitStep::TradeQuantities => Processor::divide(Trade::QUANTITY, multiplier),
            SplitStep::TradePrices => Processor::multiply(Trade::PRICE, multiplier),
        };
        match trades.invoke_all(filter.clone(), processor).await {
            Ok(results) => logging::warn(
                "split.compensated",
                "Reverted stock split step",
                json!({ "step": format!("{step:?}"), "entries": results.len() }),
            ),
            Err(err) => logging::error(
                "split.compensation_failed",
                "Could not revert stock split step",
                json!({ "step": format!("{step:?}"), "error": format!("{err:#}") }),
            ),
        }
    }
}

async fn ensure_symbol<T: Transport>(prices: &NamedCache<T, Price>, symbol: &str) -> Result<()> {
    let valid = prices.distinct(Price::SYMBOL).await?;
    if valid.iter().any(|candidate| candidate == symbol) {
        Ok(())
    } else {
        Err(Rejection::UnknownSymbol {
            symbol: symbol.to_string(),
            valid,
        }
        .into())
    }
}
