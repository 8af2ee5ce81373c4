pub const SOCKET_PATH: &str = "trade_demo.sock";
pub const REQUEST_TIMEOUT_SECS: u64 = 120;

pub const PRICE_CACHE: &str = "Price";
pub const TRADE_CACHE: &str = "Trade";

pub const TRADE_BATCH_SIZE: usize = 1_000;
pub const MAX_TRADE_QUANTITY: i64 = 1_000;
pub const MAX_SPLIT_FACTOR: i64 = 10;

pub const SYMBOLS: [&str; 6] = ["ORCL", "MSFT", "GOOG", "AAPL", "YHOO", "EMC"];
pub const INITIAL_PRICE: f64 = 20.0;
pub const MIN_PRICE: f64 = 5.0;
pub const MIN_PRICE_FACTOR: f64 = 0.95;
pub const MAX_PRICE_FACTOR: f64 = 1.06;

pub const DEFAULT_POSITIONS: usize = 100_000;
pub const PRICE_TICK_MS: u64 = 1_000;
pub const HTTP_BIND_ADDR: &str = "127.0.0.1:8080";
