use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, bail, Context, Result};
use rayon::prelude::*;
use serde_json::{Number, Value};

use crate::model::TradeSummary;
use crate::protocol::{Aggregator, Filter, Processor};

fn extract<'a>(value: &'a Value, field: &str) -> Option<&'a Value> {
    value.get(field)
}

fn group_key(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

impl Filter {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Filter::Always => true,
            Filter::Equal { field, value: expected } => extract(value, field) == Some(expected),
        }
    }
}

impl Aggregator {
    pub fn aggregate(&self, entries: &[&Value]) -> Result<Value> {
        match self {
            Aggregator::Count => Ok(Value::from(entries.len() as u64)),
            Aggregator::Distinct { field } => {
                let distinct: BTreeSet<String> = entries
                    .par_iter()
                    .filter_map(|entry| extract(entry, field))
                    .map(group_key)
                    .collect();
                Ok(Value::from(distinct.into_iter().collect::<Vec<_>>()))
            }
            Aggregator::Sum { field } => {
                let total = entries
                    .par_iter()
                    .map(|entry| numeric_field(entry, field))
                    .try_reduce(|| 0.0, |left, right| Ok(left + right))?;
                Ok(Value::from(total))
            }
            Aggregator::Summary { quantity, price } => {
                let summary = entries
                    .par_iter()
                    .map(|entry| -> Result<TradeSummary> {
                        let amount = integer_field(entry, quantity)?;
                        let unit_price = numeric_field(entry, price)?;
                        let mut summary = TradeSummary::default();
                        summary.add(amount, amount as f64 * unit_price);
                        Ok(summary)
                    })
                    .try_reduce(TradeSummary::default, |left, right| Ok(left.combine(right)))?;
                serde_json::to_value(summary).context("serialise trade summary")
            }
            Aggregator::Group { by, aggregator } => {
                let groups = entries
                    .par_iter()
                    .filter_map(|entry| extract(entry, by).map(|key| (group_key(key), *entry)))
                    .fold(BTreeMap::<String, Vec<&Value>>::new, |mut acc, (key, entry)| {
                        acc.entry(key).or_default().push(entry);
                        acc
                    })
                    .reduce(BTreeMap::new, |mut left, right| {
                        for (key, mut members) in right {
                            left.entry(key).or_default().append(&mut members);
                        }
                        left
                    });

                let mut result = serde_json::Map::with_capacity(groups.len());
                for (key, members) in groups {
                    result.insert(key, aggregator.aggregate(&members)?);
                }
                Ok(Value::Object(result))
            }
        }
    }
}

impl Processor {
    pub fn field(&self) -> &str {
        match self {
            Processor::Multiply { field, .. } | Processor::Divide { field, .. } => field,
        }
    }

    /// Apply in place and return the new field value.
    pub fn process(&self, entry: &mut Value) -> Result<Value> {
        let field = self.field();
        let current = extract(entry, field)
            .ok_or_else(|| anyhow!("entry has no field `{field}`"))?;

        let updated = match self {
            Processor::Multiply { factor, floor, .. } => scale(current, *factor, false, *floor),
            Processor::Divide { divisor, .. } => {
                if *divisor == 0.0 {
                    bail!("cannot divide `{field}` by zero");
                }
                scale(current, *divisor, true, None)
            }
        }
        .with_context(|| format!("failed to update `{field}`"))?;

        if let Some(slot) = entry.get_mut(field) {
            *slot = updated.clone();
        }
        Ok(updated)
    }
}

/// Integers stay integers when the operand is whole (and, for division, divides
/// evenly); anything else produces a float.
fn scale(current: &Value, operand: f64, divide: bool, floor: Option<f64>) -> Result<Value> {
    let Value::Number(number) = current else {
        bail!("value {current} is not numeric");
    };

    if let (Some(integer), true) = (number.as_i64(), operand.fract() == 0.0) {
        let whole = operand as i64;
        let exact = if divide {
            (whole != 0 && integer % whole == 0).then(|| integer / whole)
        } else {
            integer.checked_mul(whole)
        };
        if let Some(result) = exact {
            let result = match floor {
                Some(min) if (result as f64) <= min => min.ceil() as i64,
                _ => result,
            };
            return Ok(Value::from(result));
        }
    }

    let base = number
        .as_f64()
        .ok_or_else(|| anyhow!("value {current} is out of range"))?;
    let mut result = if divide { base / operand } else { base * operand };
    if let Some(min) = floor {
        if result <= min {
            result = min;
        }
    }
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| anyhow!("result {result} is not a finite number"))
}

fn numeric_field(entry: &Value, field: &str) -> Result<f64> {
    extract(entry, field)
        .and_then(Value::as_f64)
        .ok_or_else(|| anyhow!("entry field `{field}` is missing or not numeric"))
}

fn integer_field(entry: &Value, field: &str) -> Result<i64> {
    extract(entry, field)
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("entry field `{field}` is missing or not an integer"))
}
