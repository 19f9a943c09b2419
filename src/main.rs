//! Kiln CLI: declarative service graph assembly.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "kiln",
    version,
    about = "Declarative service graph assembly: validate, inspect and compile service graphs"
)]
struct Cli {
    #[command(subcommand)]
    command: kiln::cli::Commands,
}

fn main() {
    let filter = EnvFilter::try_from_env("KILN_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = kiln::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
