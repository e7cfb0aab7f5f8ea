use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = audit_usage_cli::Cli::parse();
    audit_usage_cli::init_tracing(cli.log_format)?;
    audit_usage_cli::run_cli(cli)
}
