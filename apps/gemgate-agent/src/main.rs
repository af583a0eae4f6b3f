use clap::Parser;

use gemgate_agent::fetch::UpstreamConfig;
use gemgate_agent::{AgentConfig, run};

#[derive(Debug, Clone, Parser)]
#[command(name = "gemgate-agent", version, about = "Session-holding upstream agent for gemgate")]
struct CliArgs {
    /// Gateway control-channel URL, including the key query parameter.
    #[arg(
        long,
        env = "GEMGATE_GATEWAY_URL",
        default_value = "ws://127.0.0.1:7860/agent/ws?key=123456"
    )]
    gateway_url: String,

    /// Upstream base URL override (testing only).
    #[arg(long, env = "GEMGATE_UPSTREAM_URL")]
    upstream_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = CliArgs::parse();
    let mut upstream = UpstreamConfig::default();
    if let Some(base_url) = args.upstream_url {
        upstream.base_url = base_url;
    }

    run(AgentConfig {
        gateway_url: args.gateway_url,
        upstream,
    })
    .await?;
    Ok(())
}
