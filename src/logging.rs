//! JSON-lines logging shared by the cache host and the demo client.
//!
//! The host logs to stdout. Demo verbs own stdout for their console output, so
//! `main` routes their log lines to stderr instead.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Output {
    Stdout = 0,
    Stderr = 1,
    Silent = 2,
}

static OUTPUT: AtomicU8 = AtomicU8::new(Output::Stdout as u8);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Level {
    Info,
    Warn,
    Error,
}

#[derive(Serialize)]
struct LogEvent<'a> {
    level: Level,
    event: &'a str,
    message: &'a str,
    timestamp_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Value>,
}

pub fn set_output(output: Output) {
    OUTPUT.store(output as u8, Ordering::Relaxed);
}

/// Shorthand used by tests and benchmarks.
pub fn set_silent(silent: bool) {
    set_output(if silent { Output::Silent } else { Output::Stdout });
}

fn output() -> Output {
    match OUTPUT.load(Ordering::Relaxed) {
        0 => Output::Stdout,
        1 => Output::Stderr,
        _ => Output::Silent,
    }
}

fn emit(level: Level, event: &str, message: &str, metadata: Option<Value>) {
    let output = output();
    if output == Output::Silent {
        return;
    }

    let entry = LogEvent {
        level,
        event,
        message,
        timestamp_ms: current_timestamp_ms(),
        metadata,
    };

    let payload = match serde_json::to_string(&entry) {
        Ok(payload) => payload,
        Err(err) => format!(
            "{{\"level\":\"error\",\"event\":\"logging_failure\",\"message\":\"failed to serialise log\",\"error\":\"{err}\"}}"
        ),
    };

    if output == Output::Stderr || level == Level::Error {
        eprintln!("{payload}");
    } else {
        println!("{payload}");
    }
}

pub fn info(event: &str, message: &str, metadata: Value) {
    emit(Level::Info, event, message, Some(metadata));
}

pub fn warn(event: &str, message: &str, metadata: Value) {
    emit(Level::Warn, event, message, Some(metadata));
}

pub fn error(event: &str, message: &str, metadata: Value) {
    emit(Level::Error, event, message, Some(metadata));
}

pub fn info_simple(event: &str, message: &str) {
    emit(Level::Info, event, message, None);
}

pub fn warn_simple(event: &str, message: &str) {
    emit(Level::Warn, event, message, None);
}

/// Milliseconds since the unix epoch; zero if the clock is before it.
pub fn current_timestamp_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
}
