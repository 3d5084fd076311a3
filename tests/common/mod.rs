//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use shellvisor::inference::{ChatRequest, InferenceError, InferenceService, Token, TokenStream};
use shellvisor::sandbox::{
    ContainerEngine, ContainerStatus, EngineError, EngineHandle, ExecOutput, LocalEngine,
    SandboxSize, SandboxSpec,
};
use shellvisor::{EngineKind, Orchestrator, OrchestratorConfig};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inference that replays the same tokens for every request
pub struct Scripted {
    tokens: Vec<Token>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl Scripted {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn content(fragments: &[&str]) -> Self {
        Self::new(fragments.iter().map(|f| Token::Content(f.to_string())).collect())
    }
}

#[async_trait]
impl InferenceService for Scripted {
    async fn stream_tokens(&self, request: ChatRequest) -> Result<TokenStream, InferenceError> {
        self.requests.lock().push(request);
        let items: Vec<Result<Token, InferenceError>> = self.tokens.iter().cloned().map(Ok).collect();
        Ok(Box::pin(futures_util::stream::iter(items)))
    }
}

/// Config rooted in `dir`, using the local engine and short timings
pub fn config(dir: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        state_dir: dir.join("state"),
        upload_dir: dir.join("uploads"),
        engine: EngineKind::Local,
        sandbox_size: SandboxSize::Small,
        quiescence: Duration::from_millis(200),
        create_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn orchestrator(config: OrchestratorConfig, inference: Arc<Scripted>) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::with_file_store(config, Arc::new(LocalEngine::new()), inference).unwrap())
}

/// How a [`FlakyEngine`] spoils its next creates
#[derive(Debug, Clone, Copy)]
pub enum CreateFault {
    Fail,
    Hang(Duration),
}

/// Local engine whose first `failures` creates go wrong
pub struct FlakyEngine {
    inner: LocalEngine,
    fault: CreateFault,
    failures: AtomicUsize,
    pub creates: AtomicUsize,
}

impl FlakyEngine {
    pub fn new(fault: CreateFault, failures: usize) -> Self {
        Self {
            inner: LocalEngine::new(),
            fault,
            failures: AtomicUsize::new(failures),
            creates: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ContainerEngine for FlakyEngine {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn lookup(&self, name: &str) -> Result<Option<(EngineHandle, ContainerStatus)>, EngineError> {
        self.inner.lookup(name).await
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<EngineHandle, EngineError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let spoiled = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if spoiled {
            match self.fault {
                CreateFault::Fail => {
                    return Err(EngineError::CommandFailed {
                        command: "create".to_string(),
                        stderr: "image not found".to_string(),
                    })
                }
                CreateFault::Hang(delay) => tokio::time::sleep(delay).await,
            }
        }
        self.inner.create(spec).await
    }

    async fn start(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.inner.start(handle).await
    }

    async fn exec(&self, handle: &EngineHandle, command: &str) -> Result<ExecOutput, EngineError> {
        self.inner.exec(handle, command).await
    }

    async fn write_stdin(&self, handle: &EngineHandle, data: &[u8]) -> Result<(), EngineError> {
        self.inner.write_stdin(handle, data).await
    }

    async fn signal(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.inner.signal(handle).await
    }

    async fn stop(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.inner.stop(handle).await
    }

    async fn remove(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.inner.remove(handle).await
    }

    async fn is_alive(&self, handle: &EngineHandle) -> bool {
        self.inner.is_alive(handle).await
    }
}

pub fn orchestrator_with_engine(
    config: OrchestratorConfig,
    engine: Arc<dyn ContainerEngine>,
    inference: Arc<Scripted>,
) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::with_file_store(config, engine, inference).unwrap())
}

/// Serve `orchestrator` on an ephemeral port
pub async fn spawn_gateway(orchestrator: Arc<Orchestrator>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        shellvisor::gateway::serve(listener, orchestrator, std::future::pending())
            .await
            .unwrap();
    });
    addr
}

pub async fn connect(addr: SocketAddr, query: &str) -> Ws {
    let (ws, _) = tokio::time::timeout(
        Duration::from_secs(5),
        connect_async(format!("ws://{}/ws?{}", addr, query)),
    )
    .await
    .expect("ws connect timed out")
    .unwrap();
    ws
}

pub async fn send(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.to_string())).await.unwrap();
}

/// Next text frame, or `None` once the server closes
pub async fn next_text(ws: &mut Ws) -> Option<String> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("no frame in time")
}

/// Read text frames until one satisfies `pred`, returning everything seen
pub async fn read_until<F>(ws: &mut Ws, mut pred: F) -> Vec<String>
where
    F: FnMut(&str) -> bool,
{
    let mut seen = Vec::new();
    while let Some(text) = next_text(ws).await {
        let done = pred(&text);
        seen.push(text);
        if done {
            return seen;
        }
    }
    panic!("connection closed before the expected frame; saw {seen:?}");
}

pub fn json(text: &str) -> serde_json::Value {
    serde_json::from_str(text).unwrap_or(serde_json::Value::Null)
}

pub fn is_finished(text: &str) -> bool {
    json(text).get("exec_finished").is_some()
}

pub fn is_result_for(text: &str, command: &str) -> bool {
    json(text)["command"] == command
}
