pub mod app;
pub mod config;
pub mod http;
pub mod logging;
pub mod outbound;
pub mod telemetry;
pub mod tunnel;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
