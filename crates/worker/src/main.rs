use clap::Parser;

use loyalty_worker::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    loyalty_observability::init_with(cli.log_format);

    loyalty_worker::run(cli).await
}
