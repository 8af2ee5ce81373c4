use anyhow::Result;
use trade_demo::cli::{Cli, Command, Invocation};
use trade_demo::logging::{self, Output};
use trade_demo::{client, commands, grid};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::interpret(std::env::args_os()) {
        Invocation::Run(cli) => cli,
        Invocation::Info(text) => {
            print!("{text}");
            return Ok(());
        }
        Invocation::Usage => {
            commands::print_usage();
            return Ok(());
        }
    };

    let client_config = cli.client_config();
    let socket = cli.socket.clone();
    match cli.command() {
        Some(Command::Serve(args)) => grid::run_with_config(args.into_config(socket)).await,
        Some(Command::Demo(command)) => {
            logging::set_output(Output::Stderr);
            let session = client::connect(client_config).await?;
            commands::run(&session, command).await
        }
        None => {
            commands::print_usage();
            Ok(())
        }
    }
}
