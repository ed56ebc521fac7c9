use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = rowtrace_cli::Cli::parse();
    rowtrace_cli::run_cli(cli)
}
