use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use gemgate_common::{GatewayConfigPatch, StreamingMode, parse_key_csv, parse_status_code_csv};
use gemgate_core::coordinator::CoordinatorConfig;
use gemgate_core::link::DEFAULT_RECONNECT_GRACE;
use gemgate_core::{
    AgentLink, CredentialStore, LinkEvent, OperatorState, RequestCoordinator, RotationConfig,
    RotationController, SessionManager,
};
use gemgate_router::{AdminState, ProxyState, admin_router, proxy_router};

#[derive(Debug, Clone, Parser)]
#[command(name = "gemgate", version, about = "Browser-session LLM gateway with credential rotation")]
struct CliArgs {
    /// Bind host.
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Bind port.
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Streaming mode for downstream SSE (real|fake).
    #[arg(long, env = "STREAMING_MODE")]
    streaming_mode: Option<String>,

    /// Consecutive failures before a forced switch (0 disables).
    #[arg(long, env = "FAILURE_THRESHOLD")]
    failure_threshold: Option<u32>,

    /// Generative uses before a drain-then-switch (0 disables).
    #[arg(long, env = "SWITCH_ON_USES")]
    switch_on_uses: Option<u32>,

    /// Fake-stream retry attempts.
    #[arg(long, env = "MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Delay between fake-stream retries, in milliseconds.
    #[arg(long, env = "RETRY_DELAY")]
    retry_delay_ms: Option<u64>,

    /// Upstream statuses that switch immediately (csv, 400-599).
    #[arg(long, env = "IMMEDIATE_SWITCH_STATUS_CODES")]
    immediate_switch_status_codes: Option<String>,

    /// Accepted downstream API keys (csv).
    #[arg(long, env = "API_KEYS")]
    api_keys: Option<String>,

    /// Credential index to bind first.
    #[arg(long, env = "INITIAL_AUTH_INDEX")]
    initial_auth_index: Option<u32>,

    /// Directory holding auth-<N>.json credential files.
    #[arg(long, env = "AUTH_DIR")]
    auth_dir: Option<String>,

    /// Auto-resume re-dispatch budget per request.
    #[arg(long, env = "RESUME_LIMIT")]
    resume_limit: Option<u32>,
}

impl CliArgs {
    fn into_patch(self) -> GatewayConfigPatch {
        GatewayConfigPatch {
            host: self.host,
            port: self.port,
            streaming_mode: self.streaming_mode.as_deref().and_then(StreamingMode::parse),
            failure_threshold: self.failure_threshold,
            switch_on_uses: self.switch_on_uses,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay_ms.map(Duration::from_millis),
            immediate_switch_status_codes: self
                .immediate_switch_status_codes
                .as_deref()
                .map(parse_status_code_csv),
            api_keys: self.api_keys.as_deref().map(parse_key_csv),
            initial_auth_index: self.initial_auth_index,
            auth_dir: self.auth_dir,
            resume_limit: self.resume_limit,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = CliArgs::parse().into_patch().into_config();

    let store = Arc::new(
        CredentialStore::discover(Path::new(&config.auth_dir), std::env::vars())
            .context("credential discovery")?,
    );
    let initial_index = config
        .initial_auth_index
        .filter(|index| store.available_indices().contains(index))
        .unwrap_or_else(|| store.available_indices()[0]);

    let link = AgentLink::new(DEFAULT_RECONNECT_GRACE);
    let binder = Arc::new(SessionManager::new(link.clone(), store.clone()));
    let rotation = Arc::new(RotationController::new(
        RotationConfig {
            failure_threshold: config.failure_threshold,
            switch_on_uses: config.switch_on_uses,
            immediate_switch_status_codes: config.immediate_switch_status_codes.clone(),
        },
        store.clone(),
        binder,
        initial_index,
    ));
    let operator = Arc::new(OperatorState::new(
        config.streaming_mode,
        config.resume_limit,
    ));
    let coordinator = Arc::new(RequestCoordinator::new(
        link.clone(),
        rotation.clone(),
        operator,
        CoordinatorConfig {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
        },
    ));

    // Bind the initial credential whenever the agent (re)connects.
    {
        let mut events = link.subscribe();
        let rotation = rotation.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    LinkEvent::Connected => {
                        if let Err(err) = rotation.recover().await {
                            tracing::warn!(error = %err, "initial session bind failed");
                        }
                    }
                    LinkEvent::ConnectionLost => {
                        tracing::warn!("agent link lost after grace window");
                    }
                }
            }
        });
    }

    let api_keys = Arc::new(config.api_keys.clone());
    let app = axum::Router::new()
        .merge(admin_router(AdminState {
            coordinator: coordinator.clone(),
            rotation: rotation.clone(),
            link: link.clone(),
            store: store.clone(),
            api_keys: api_keys.clone(),
        }))
        .merge(proxy_router(ProxyState {
            coordinator,
            api_keys,
        }));

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    tracing::info!(bind = %bind, accounts = store.available_indices().len(), "gemgate listening");
    axum::serve(listener, app).await?;
    Ok(())
}
