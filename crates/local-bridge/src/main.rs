mod bridge;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "local-bridge",
    version,
    about = "local-bridge - expose a NAT-hidden HTTP service through a public preview URL"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses BRIDGE_CONFIG; then auto-detects bridge.toml > bridge.yaml > bridge.yml from CWD; then falls back to the OS default path (Linux: /etc/local-bridge/bridge.toml; others: user config dir).
    #[arg(long, env = "BRIDGE_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    bridge::run(cli.config).await
}
