use anyhow::Result;
use clap::Parser;
use gossipkv::{
    config::Config,
    logging::{init_logging, LoggingConfig},
    server,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    init_logging(LoggingConfig {
        debug: config.debug,
        json: config.log_json,
    })?;

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        return Err(e);
    }

    if let Err(e) = server::run(config).await {
        tracing::error!(error = ?e, "Fatal error");
        return Err(e);
    }
    Ok(())
}
