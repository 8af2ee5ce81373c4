use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::task::JoinHandle;
use trade_demo::client::{self, ClientConfig, SocketTransport};
use trade_demo::commands;
use trade_demo::constants::{PRICE_CACHE, SYMBOLS, TRADE_CACHE};
use trade_demo::grid::{self, GridConfig};
use trade_demo::logging;
use trade_demo::model::{ChartData, Price, Trade};
use trade_demo::protocol::Response;
use trade_demo::session::Session;

struct Host {
    socket_path: PathBuf,
    handle: JoinHandle<()>,
}

impl Drop for Host {
    fn drop(&mut self) {
        self.handle.abort();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

fn socket_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("trade-demo-{}-{name}.sock", std::process::id()))
}

fn start_host(name: &str, configure: impl FnOnce(&mut GridConfig)) -> Host {
    logging::set_silent(true);
    let mut config = GridConfig {
        socket_path: socket_path(name),
        http_addr: None,
        price_tick: None,
        seed_data: true,
        initial_positions: 500,
    };
    configure(&mut config);
    let socket_path = config.socket_path.clone();
    let handle = tokio::spawn(async move {
        let _ = grid::run_with_config(config).await;
    });
    Host {
        socket_path,
        handle,
    }
}

async fn connect(host: &Host) -> Session<SocketTransport> {
    let config = ClientConfig {
        socket_path: host.socket_path.clone(),
        request_timeout: Duration::from_secs(5),
    };
    for _ in 0..100 {
        if let Ok(session) = client::connect(config.clone()).await {
            return session;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("cache host never opened {:?}", host.socket_path);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn demo_verbs_work_over_the_socket() {
    let host = start_host("verbs", |_| {});
    let session = connect(&host).await;
    let trades = session.cache::<Trade>(TRADE_CACHE);
    let prices = session.cache::<Price>(PRICE_CACHE);

    let sizes = commands::size(&trades, &prices).await.expect("size");
    assert_eq!(sizes.trades, 500);
    assert_eq!(sizes.prices, SYMBOLS.len());

    let size = commands::add_trades(&trades, &prices, "ORCL", 1_200)
        .await
        .expect("add trades");
    assert_eq!(size, 1_700);

    let report = commands::stock_split(&trades, &prices, "ORCL", 2)
        .await
        .expect("split");
    assert!(report.trades_updated >= 1_200);
    assert_eq!(report.old_price, 20.0);
    assert_eq!(report.new_price, 10.0);

    let quote = prices.get("ORCL").await.expect("get").expect("present");
    assert_eq!(quote.price, 10.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejected_input_leaves_caches_untouched() {
    let host = start_host("rejections", |config| config.initial_positions = 10);
    let session = connect(&host).await;
    let trades = session.cache::<Trade>(TRADE_CACHE);
    let prices = session.cache::<Price>(PRICE_CACHE);

    assert!(commands::add_trades(&trades, &prices, "ORCL", -1).await.is_err());
    assert!(commands::add_trades(&trades, &prices, "XYZ", 5).await.is_err());
    assert!(commands::stock_split(&trades, &prices, "ORCL", 0).await.is_err());

    assert_eq!(trades.size().await.expect("size"), 10);
    let quote = prices.get("ORCL").await.expect("get").expect("present");
    assert_eq!(quote.price, 20.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn monitor_receives_ticker_updates() {
    let host = start_host("monitor", |config| {
        config.initial_positions = 0;
        config.price_tick = Some(Duration::from_millis(10));
    });
    let session = connect(&host).await;
    let prices = session.cache::<Price>(PRICE_CACHE);

    let seen = tokio::time::timeout(Duration::from_secs(5), commands::monitor(&prices, Some(3)))
        .await
        .expect("monitor should see three ticks")
        .expect("monitor");
    assert_eq!(seen, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_lines_get_error_frames() {
    let host = start_host("malformed", |config| config.seed_data = false);
    drop(connect(&host).await);

    let stream = UnixStream::connect(&host.socket_path).await.expect("connect");
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(b"not json\n").await.expect("write");
    let line = lines.next_line().await.expect("read").expect("frame");
    let response: Response = serde_json::from_str(&line).expect("response frame");
    assert!(matches!(response, Response::Error { .. }));

    writer
        .write_all(b"{\"op\":\"size\",\"cache\":\"Trade\"}\n")
        .await
        .expect("write");
    let line = lines.next_line().await.expect("read").expect("frame");
    let response: Response = serde_json::from_str(&line).expect("response frame");
    assert_eq!(response, Response::Size { size: 0 });
}

async fn open_http(addr: SocketAddr, path: &str) -> TcpStream {
    let mut stream = loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(err) => panic!("failed to reach http endpoint: {err}"),
        }
    };
    let request =
        format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("send request");
    stream
}

/// Status line and body of a complete, non-streaming response.
async fn http_get(addr: SocketAddr, path: &str) -> (String, String) {
    let mut stream = open_http(addr, path).await;
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.expect("read response");
    let text = String::from_utf8(raw).expect("utf8 response");
    let (head, body) = text.split_once("\r\n\r\n").expect("http response");
    let status = head.lines().next().unwrap_or_default().to_string();
    (status, body.to_string())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chart_data_endpoint_reports_positions() {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9131);
    let host = start_host("chart", |config| {
        config.initial_positions = 250;
        config.http_addr = Some(addr);
    });
    drop(connect(&host).await);

    let (status, body) = http_get(addr, "/service/chart-data/true").await;
    assert!(status.starts_with("HTTP/1.1 200"), "unexpected status: {status}");

    let chart: ChartData = serde_json::from_str(&body).expect("chart data json");
    assert_eq!(chart.position_count, 250);
    assert_eq!(chart.symbol_price.len(), SYMBOLS.len());
    assert_eq!(chart.symbol_count.values().sum::<u64>(), 250);
    assert!(chart.original_valuation > 0.0);
    assert!(chart.symbols.iter().all(|symbol| SYMBOLS.contains(&symbol.as_str())));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn developer_endpoints_insert_populate_and_clear() {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9132);
    let host = start_host("developer", |config| {
        config.seed_data = false;
        config.initial_positions = 40;
        config.http_addr = Some(addr);
    });
    let session = connect(&host).await;
    let trades = session.cache::<Trade>(TRADE_CACHE);
    let prices = session.cache::<Price>(PRICE_CACHE);

    let (status, _) = http_get(addr, "/service/developer/insert/25").await;
    assert!(status.starts_with("HTTP/1.1 200"), "insert: {status}");
    assert_eq!(trades.size().await.expect("size"), 25);
    assert_eq!(prices.size().await.expect("size"), SYMBOLS.len());

    let (status, _) = http_get(addr, "/service/developer/populate").await;
    assert!(status.starts_with("HTTP/1.1 200"), "populate: {status}");
    assert_eq!(trades.size().await.expect("size"), 65);

    let (status, _) = http_get(addr, "/service/developer/clear").await;
    assert!(status.starts_with("HTTP/1.1 200"), "clear: {status}");
    assert_eq!(trades.size().await.expect("size"), 0);
    assert_eq!(prices.size().await.expect("size"), SYMBOLS.len());

    let (status, _) = http_get(addr, "/service/developer/shutdown").await;
    assert!(status.starts_with("HTTP/1.1 404"), "unknown command: {status}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn price_events_stream_over_sse() {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9133);
    let host = start_host("events", |config| {
        config.initial_positions = 0;
        config.price_tick = Some(Duration::from_millis(20));
        config.http_addr = Some(addr);
    });
    drop(connect(&host).await);

    let mut stream = open_http(addr, "/service/events/subscribe").await;
    let mut received = String::new();
    let mut chunk = [0u8; 4096];
    tokio::time::timeout(Duration::from_secs(5), async {
        while !received.contains("event: priceUpdate") {
            let read = stream.read(&mut chunk).await.expect("read events");
            assert!(read > 0, "event stream ended early: {received}");
            received.push_str(&String::from_utf8_lossy(&chunk[..read]));
        }
    })
    .await
    .expect("a price update within five seconds");

    assert!(received.starts_with("HTTP/1.1 200"), "unexpected response: {received}");
    assert!(received.contains("text/event-stream"));
    assert!(received.contains("event: begin"));
    assert!(received.contains("\"symbol\""));
}
