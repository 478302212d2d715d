use admission_bridge::{cli, config::Config, tracing::setup_tracing, AdmissionBridge};
use anyhow::Result;
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli::build_cli().get_matches();
    let config = Config::from_args(&matches)?;

    setup_tracing(&config.log_level, &config.log_fmt, config.log_no_color)?;
    debug!("tracing system ready");

    let bridge = AdmissionBridge::new_from_config(config).await?;
    bridge.run().await
}
