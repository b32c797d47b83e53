use clap::Parser;

use vm::cli::Cli;
use vm::{commands, logging};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log = logging::init(cli.verbose);

    if let Err(err) = commands::dispatch(cli.command, log).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
