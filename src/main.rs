use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use shellvisor::config::{EngineKind, OrchestratorConfig};
use shellvisor::gateway::serve;
use shellvisor::inference::OllamaClient;
use shellvisor::orchestrator::Orchestrator;
use shellvisor::sandbox::{ContainerEngine, DockerEngine, LocalEngine, SandboxSize};
use shellvisor::tracing::{init_tracing, shutdown_tracing};

#[derive(Parser, Debug)]
#[command(name = "shellvisor", author, version, about = "Per-user sandboxed shells over WebSockets")]
struct Options {
    /// Address the gateway binds to
    #[arg(long, env = "SHELLVISOR_LISTEN", default_value = "127.0.0.1:8765")]
    listen: String,
    /// Default model for chat turns
    #[arg(long, env = "SHELLVISOR_MODEL", default_value = "qwen3")]
    model: String,
    /// Ollama base URL
    #[arg(long, env = "SHELLVISOR_INFERENCE_URL", default_value = "http://localhost:11434")]
    inference_url: String,
    /// Directory listed by `list-directory` (one subdirectory per user)
    #[arg(long, env = "SHELLVISOR_UPLOAD_DIR", default_value = "./uploads")]
    upload_dir: PathBuf,
    /// Root for notifications, conversations and sandbox home directories
    #[arg(long, env = "SHELLVISOR_STATE_DIR", default_value = "./state")]
    state_dir: PathBuf,
    /// Container image for new sandboxes
    #[arg(long, env = "SHELLVISOR_IMAGE", default_value = "ubuntu:24.04")]
    image: String,
    /// Container name template; `{user}` is replaced by the user's sandbox key
    #[arg(long, env = "SHELLVISOR_NAME_TEMPLATE", default_value = "shellvisor-{user}")]
    name_template: String,
    /// Remove sandboxes on teardown and crash instead of keeping them for restart
    #[arg(long, env = "SHELLVISOR_EPHEMERAL")]
    ephemeral: bool,
    /// Engine backing the sandboxes
    #[arg(long, env = "SHELLVISOR_ENGINE", value_enum, default_value = "docker")]
    engine: EngineKind,
    /// docker-compatible CLI to drive (e.g. podman)
    #[arg(long, env = "SHELLVISOR_DOCKER_BIN", default_value = "docker")]
    docker_bin: String,
    /// Resource preset for each sandbox
    #[arg(long, env = "SHELLVISOR_SANDBOX_SIZE", value_enum, default_value = "medium")]
    sandbox_size: SandboxSize,
    /// Quiet period after a prompt-like line before asking for stdin (ms)
    #[arg(long, env = "SHELLVISOR_QUIESCENCE_MS", default_value_t = 300)]
    quiescence_ms: u64,
    /// Kill executions waiting on stdin longer than this (seconds, 0 = never)
    #[arg(long, env = "SHELLVISOR_INPUT_TIMEOUT_SECS", default_value_t = 0)]
    input_timeout_secs: u64,
    /// Bound on sandbox creation (seconds)
    #[arg(long, env = "SHELLVISOR_CREATE_TIMEOUT_SECS", default_value_t = 120)]
    create_timeout_secs: u64,
    /// Engine create operations allowed at once
    #[arg(long, env = "SHELLVISOR_MAX_CONCURRENT_CREATES", default_value_t = 4)]
    max_concurrent_creates: usize,
    /// Events buffered per connection before it is dropped as slow
    #[arg(long, env = "SHELLVISOR_SUBSCRIBER_BUFFER", default_value_t = 256)]
    subscriber_buffer: usize,
    /// Output kept per execution for status and non-streaming results (bytes)
    #[arg(long, env = "SHELLVISOR_MAX_OUTPUT_BYTES", default_value_t = 256 * 1024)]
    max_output_bytes: usize,
    /// Shared token clients must present
    #[arg(long, env = "SHELLVISOR_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,
    /// Inbound frames per second allowed per connection
    #[arg(long, env = "SHELLVISOR_FRAMES_PER_SECOND", default_value_t = 20.0)]
    frames_per_second: f64,
    /// Log level for shellvisor targets (RUST_LOG overrides)
    #[arg(long, env = "SHELLVISOR_LOG_LEVEL", default_value = "info")]
    log_level: String,
    /// Emit JSON log lines
    #[arg(long, env = "SHELLVISOR_LOG_JSON")]
    log_json: bool,
    /// OTLP gRPC endpoint for span export
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

impl Options {
    fn config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            listen_addr: self.listen.clone(),
            model: self.model.clone(),
            inference_url: self.inference_url.clone(),
            upload_dir: self.upload_dir.clone(),
            state_dir: self.state_dir.clone(),
            image: self.image.clone(),
            name_template: self.name_template.clone(),
            persist: !self.ephemeral,
            engine: self.engine,
            sandbox_size: self.sandbox_size,
            quiescence: Duration::from_millis(self.quiescence_ms),
            input_timeout: (self.input_timeout_secs > 0)
                .then(|| Duration::from_secs(self.input_timeout_secs)),
            create_timeout: Duration::from_secs(self.create_timeout_secs),
            max_concurrent_creates: self.max_concurrent_creates.max(1),
            subscriber_buffer: self.subscriber_buffer.max(1),
            max_output_bytes: self.max_output_bytes,
            auth_token: self.auth_token.clone().filter(|t| !t.is_empty()),
            frames_per_second: self.frames_per_second,
        }
    }
}

async fn build_engine(options: &Options) -> Result<Arc<dyn ContainerEngine>, Box<dyn std::error::Error + Send + Sync>> {
    match options.engine {
        EngineKind::Docker => {
            let engine = DockerEngine::with_binary(&options.docker_bin);
            let version = engine.ping().await?;
            info!(binary = %options.docker_bin, %version, "container engine reachable");
            Ok(Arc::new(engine))
        }
        EngineKind::Local => {
            warn!("using the local engine: commands run unisolated on this host");
            Ok(Arc::new(LocalEngine::new()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let options = Options::parse();
    init_tracing(
        "shellvisor",
        &options.log_level,
        options.otlp_endpoint.as_deref(),
        options.log_json,
    )?;

    let config = options.config();
    info!(
        listen = %config.listen_addr,
        engine = ?config.engine,
        image = %config.image,
        persist = config.persist,
        model = %config.model,
        "starting shellvisor"
    );

    let engine = match build_engine(&options).await {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "container engine unavailable");
            shutdown_tracing();
            return Err(e);
        }
    };

    let inference = OllamaClient::new(config.inference_url.clone());
    if let Err(e) = inference.ping().await {
        // Chat turns fail until it comes up; commands still work
        warn!(url = %config.inference_url, error = %e, "inference service unreachable");
    }

    let listener = TcpListener::bind(&config.listen_addr).await?;
    let orchestrator = Arc::new(Orchestrator::with_file_store(config, engine, Arc::new(inference))?);

    let result = serve(listener, orchestrator, shutdown_signal()).await;
    info!("gateway stopped");
    shutdown_tracing();
    result?;
    Ok(())
}
