use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = tracing_history_cli::Cli::parse();
    tracing_history_cli::init_tracing(cli.verbosity());
    tracing_history_cli::run_cli(cli)
}
