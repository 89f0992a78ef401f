use clap::Parser;
use keel::tracing_support::init_subscriber;
use keel::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();
    init_subscriber(&config.tracing_config());

    keel::server::run(config).await
}
