use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand};

use crate::client::ClientConfig;
use crate::constants::{DEFAULT_POSITIONS, HTTP_BIND_ADDR, PRICE_TICK_MS, SOCKET_PATH};
use crate::grid::GridConfig;

#[derive(Debug, Parser)]
#[command(author, version, about = "Trade demo client for the Price and Trade caches")]
pub struct Cli {
    /// Unix socket of the cache host
    #[arg(long, global = true, default_value = SOCKET_PATH)]
    pub socket: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

/// What a command line asks for once parsing is done.
#[derive(Debug)]
pub enum Invocation {
    Run(Cli),
    /// `--help` or `--version`; clap has already rendered the text.
    Info(String),
    Usage,
}

impl Cli {
    /// Parse without exiting: anything clap rejects falls back to the usage text.
    pub fn interpret<I, T>(args: I) -> Invocation
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        match Cli::try_parse_from(args) {
            Ok(cli) if cli.command.is_some() => Invocation::Run(cli),
            Ok(_) => Invocation::Usage,
            Err(err) => match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    Invocation::Info(err.render().to_string())
                }
                _ => Invocation::Usage,
            },
        }
    }

    pub fn command(self) -> Option<Command> {
        self.command
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            socket_path: self.socket.clone(),
            ..ClientConfig::default()
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    #[command(flatten)]
    Demo(DemoCommand),
    /// Host the Price and Trade caches on the unix socket
    Serve(ServeArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum DemoCommand {
    /// Display the cache sizes
    Size,
    /// Monitor price changes until interrupted
    Monitor(MonitorArgs),
    /// Add random trades for a symbol
    AddTrades(AddTradesArgs),
    /// Split a stock by a factor
    StockSplit(StockSplitArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct MonitorArgs {
    /// Stop after printing this many price changes
    #[arg(short, long)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct AddTradesArgs {
    pub symbol: String,
    #[arg(allow_negative_numbers = true)]
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct StockSplitArgs {
    pub symbol: String,
    #[arg(allow_negative_numbers = true)]
    pub factor: i64,
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Start with empty caches
    #[arg(long)]
    pub no_data: bool,

    /// Number of random positions created at startup
    #[arg(long, default_value_t = DEFAULT_POSITIONS)]
    pub positions: usize,

    /// Milliseconds between price ticks; 0 disables the ticker
    #[arg(long, default_value_t = PRICE_TICK_MS)]
    pub tick_ms: u64,

    /// Serve chart data over HTTP; a bare `--http` binds the default address
    #[arg(long, num_args = 0..=1, default_missing_value = HTTP_BIND_ADDR)]
    pub http: Option<SocketAddr>,
}

impl ServeArgs {
    pub fn into_config(self, socket_path: PathBuf) -> GridConfig {
        GridConfig {
            socket_path,
            http_addr: self.http,
            price_tick: (self.tick_ms > 0).then(|| Duration::from_millis(self.tick_ms)),
            seed_data: !self.no_data,
            initial_positions: self.positions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo(args: &[&str]) -> Option<DemoCommand> {
        let argv = std::iter::once("trade-demo").chain(args.iter().copied());
        match Cli::interpret(argv) {
            Invocation::Run(cli) => match cli.command() {
                Some(Command::Demo(command)) => Some(command),
                _ => None,
            },
            _ => None,
        }
    }

    fn is_usage(args: &[&str]) -> bool {
        let argv = std::iter::once("trade-demo").chain(args.iter().copied());
        matches!(Cli::interpret(argv), Invocation::Usage)
    }

    #[test]
    fn verbs_parse_positional_arguments() {
        assert_eq!(demo(&["size"]), Some(DemoCommand::Size));
        assert_eq!(
            demo(&["add-trades", "ORCL", "2500"]),
            Some(DemoCommand::AddTrades(AddTradesArgs {
                symbol: "ORCL".into(),
                count: 2500
            }))
        );
        assert_eq!(
            demo(&["stock-split", "MSFT", "2"]),
            Some(DemoCommand::StockSplit(StockSplitArgs {
                symbol: "MSFT".into(),
                factor: 2
            }))
        );
        assert_eq!(
            demo(&["monitor", "--limit", "3"]),
            Some(DemoCommand::Monitor(MonitorArgs { limit: Some(3) }))
        );
    }

    #[test]
    fn negative_numbers_reach_validation() {
        assert_eq!(
            demo(&["add-trades", "ORCL", "-1"]),
            Some(DemoCommand::AddTrades(AddTradesArgs {
                symbol: "ORCL".into(),
                count: -1
            }))
        );
    }

    #[test]
    fn bad_invocations_fall_back_to_usage() {
        assert!(is_usage(&[]));
        assert!(is_usage(&["frobnicate"]));
        assert!(is_usage(&["add-trades", "ORCL"]));
        assert!(is_usage(&["stock-split"]));
        assert!(is_usage(&["add-trades", "ORCL", "lots"]));
    }

    #[test]
    fn help_is_not_usage() {
        let argv = ["trade-demo", "--help"];
        assert!(matches!(Cli::interpret(argv), Invocation::Info(_)));
    }

    #[test]
    fn serve_flags_map_onto_grid_config() {
        let argv = [
            "trade-demo",
            "--socket",
            "/tmp/grid.sock",
            "serve",
            "--no-data",
            "--tick-ms",
            "0",
            "--http",
            "127.0.0.1:9090",
        ];
        let Invocation::Run(cli) = Cli::interpret(argv) else {
            panic!("serve should parse");
        };
        let socket = cli.socket.clone();
        let Some(Command::Serve(args)) = cli.command() else {
            panic!("expected serve");
        };
        let config = args.into_config(socket);
        assert_eq!(config.socket_path, PathBuf::from("/tmp/grid.sock"));
        assert!(!config.seed_data);
        assert_eq!(config.price_tick, None);
        assert_eq!(config.http_addr, Some("127.0.0.1:9090".parse().unwrap()));
    }

    #[test]
    fn bare_http_flag_uses_default_address() {
        let Invocation::Run(cli) = Cli::interpret(["trade-demo", "serve", "--http"]) else {
            panic!("serve should parse");
        };
        let Some(Command::Serve(args)) = cli.command() else {
            panic!("expected serve");
        };
        assert_eq!(args.http, Some(HTTP_BIND_ADDR.parse().unwrap()));
        assert_eq!(args.positions, DEFAULT_POSITIONS);
    }
}
