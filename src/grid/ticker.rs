use std::sync::Arc;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

use crate::constants::{MAX_PRICE_FACTOR, MIN_PRICE, MIN_PRICE_FACTOR, PRICE_CACHE};
use crate::logging;
use crate::model::Price;
use crate::protocol::Processor;
use crate::session::{NamedCache, Session, Transport};

use super::{Grid, GridConfig, ShutdownSignal};

pub(crate) async fn run_price_ticker(
    config: Arc<GridConfig>,
    session: Session<Grid>,
    mut shutdown: watch::Receiver<ShutdownSignal>,
) -> Result<()> {
    let Some(period) = config.price_tick else {
        logging::info_simple("price_ticker.disabled", "Price ticker disabled");
        return Ok(());
    };

    let prices = session.cache::<Price>(PRICE_CACHE);
    let mut rng = StdRng::from_entropy();
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.reset();

    logging::info(
        "price_ticker.start",
        "Price ticker started",
        json!({ "period_ms": period.as_millis() }),
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = update_random_price(&prices, &mut rng).await {
                    logging::error(
                        "price_ticker.update_failed",
                        "Failed to apply price tick",
                        json!({ "error": format!("{err:#}") }),
                    );
                }
            }
            _ = shutdown.changed() => {
                match *shutdown.borrow() {
                    ShutdownSignal::None => continue,
                    _ => break,
                }
            }
        }
    }

    logging::info_simple("price_ticker.stop", "Price ticker stopped");
    Ok(())
}

/// Nudge one randomly chosen symbol by a factor in `[0.95, 1.06)`, never
/// letting it fall below the minimum price. Returns the symbol touched.
pub async fn update_random_price<T: Transport>(
    prices: &NamedCache<T, Price>,
    rng: &mut StdRng,
) -> Result<Option<String>> {
    let symbols = prices.key_set().await?;
    let Some(symbol) = symbols.choose(rng).cloned() else {
        return Ok(None);
    };

    let factor = rng.gen::<f64>() * (MAX_PRICE_FACTOR - MIN_PRICE_FACTOR) + MIN_PRICE_FACTOR;
    prices
        .invoke(
            &symbol,
            Processor::multiply_with_floor(Price::PRICE, factor, MIN_PRICE),
        )
        .await?;
    Ok(Some(symbol))
}
