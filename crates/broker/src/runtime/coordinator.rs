//! The session coordinator: the broker's public entry point.
//!
//! Wires the adapter registry, the process supervisor, the persisted
//! session store, and the bridge; composes launchers for subprocess-backed
//! adapters before handing the connection to the bridge.

use std::sync::Arc;

use serde_json::{Map, Value};

use bc_adapters::acp::AcpAdapter;
use bc_adapters::agent_sdk::{AgentQuery, AgentSdkAdapter};
use bc_adapters::claude::ClaudeAdapter;
use bc_adapters::codex::CodexAdapter;
use bc_adapters::gemini::gemini_adapter;
use bc_adapters::opencode::{self, OpenCodeAdapter};
use bc_adapters::registry::AdapterRegistry;
use bc_adapters::traits::ConnectOptions;
use bc_domain::config::BrokerConfig;
use bc_domain::error::Result;
use bc_domain::events::{BridgeEvent, EventHub};
use bc_sessions::store::SessionStore;
use bc_supervisor::process::{ProcessSupervisor, SpawnSpec, SupervisorEvent};

use crate::consumers::gatekeeper::ConsumerAuthenticator;
use crate::runtime::bridge::{SessionBridge, SessionSeed};
use crate::runtime::session::SessionSnapshot;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Git seeding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct GitInfo {
    pub branch: String,
    pub is_worktree: bool,
    pub repo_root: String,
    pub ahead: i64,
    pub behind: i64,
}

/// Injected resolver for the git fields seeded into new session state.
pub trait GitInfoResolver: Send + Sync {
    fn resolve(&self, cwd: &str) -> Option<GitInfo>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Coordinator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct CreateSessionParams {
    pub adapter_name: Option<String>,
    pub adapter_options: Option<Value>,
    pub resume: bool,
    pub cwd: Option<String>,
    pub model: Option<String>,
    /// Resume an existing persisted session id instead of minting one.
    pub session_id: Option<String>,
}

pub struct SessionCoordinator {
    config: Arc<BrokerConfig>,
    bridge: SessionBridge,
    registry: AdapterRegistry,
    supervisor: ProcessSupervisor,
    store: Arc<SessionStore>,
    hub: EventHub,
    claude: Arc<ClaudeAdapter>,
    git: Option<Arc<dyn GitInfoResolver>>,
}

impl SessionCoordinator {
    pub fn new(
        config: Arc<BrokerConfig>,
        authenticator: Option<Arc<dyn ConsumerAuthenticator>>,
        git: Option<Arc<dyn GitInfoResolver>>,
        agent_query: Option<Arc<dyn AgentQuery>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let hub = EventHub::default();
        let store = Arc::new(SessionStore::new(&config.server.state_path)?);
        let bridge = SessionBridge::new(config.clone(), hub.clone(), authenticator);
        let (supervisor, supervisor_events) =
            ProcessSupervisor::new(config.supervisor.clone(), config.breaker.clone());

        let claude = Arc::new(ClaudeAdapter::new());
        let mut registry = AdapterRegistry::new();
        registry.register(claude.clone());
        registry.register(Arc::new(CodexAdapter::new()));
        registry.register(Arc::new(AcpAdapter::new("acp-agent", Vec::new())));
        registry.register(Arc::new(gemini_adapter()));
        registry.register(Arc::new(OpenCodeAdapter::new()));
        if let Some(query) = agent_query {
            registry.register(Arc::new(AgentSdkAdapter::new(query)));
        }
        tracing::info!(adapters = ?registry.names(), "adapter registry ready");

        let coordinator = Arc::new(Self {
            config,
            bridge,
            registry,
            supervisor,
            store,
            hub,
            claude,
            git,
        });

        Self::spawn_supervisor_listener(&coordinator, supervisor_events);
        Self::spawn_event_listener(&coordinator);
        Self::spawn_idle_reaper(&coordinator);
        Ok(coordinator)
    }

    pub fn bridge(&self) -> &SessionBridge {
        &self.bridge
    }

    pub fn claude(&self) -> &Arc<ClaudeAdapter> {
        &self.claude
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    /// The CLI for a Claude-style session connected back; readiness proven.
    pub fn cli_connected(&self, session_id: &str) {
        self.supervisor.mark_ready(session_id);
    }

    // ── Public operations ────────────────────────────────────────────

    pub async fn create_session(&self, params: CreateSessionParams) -> Result<String> {
        let session_id = params
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let adapter_name = params
            .adapter_name
            .clone()
            .unwrap_or_else(|| self.config.sessions.default_adapter.clone());

        if self.store.get(&session_id).is_none() {
            self.store.insert(
                &session_id,
                &adapter_name,
                params.model.clone(),
                params.cwd.clone(),
            );
        }

        let mut seed = SessionSeed {
            model: params.model.clone(),
            cwd: params.cwd.clone(),
            ..Default::default()
        };
        if let (Some(git), Some(cwd)) = (&self.git, &params.cwd) {
            if let Some(info) = git.resolve(cwd) {
                seed.git_branch = Some(info.branch);
                seed.is_worktree = Some(info.is_worktree);
                seed.repo_root = Some(info.repo_root);
                seed.git_ahead = Some(info.ahead);
                seed.git_behind = Some(info.behind);
            }
        }
        self.bridge.create_session(&session_id, &adapter_name, seed);

        self.connect_adapter(
            &session_id,
            &adapter_name,
            params.adapter_options.clone(),
            params.resume,
            params.cwd.as_deref(),
        )
        .await?;

        self.hub.emit(BridgeEvent::SessionCreated {
            session_id: session_id.clone(),
            adapter: adapter_name,
        });
        let _ = self.store.flush();
        Ok(session_id)
    }

    pub async fn delete_session(&self, session_id: &str) -> bool {
        let closed = self.bridge.close_session(session_id).await;
        self.supervisor.kill(session_id).await;
        let removed = self.store.remove(session_id);
        let _ = self.store.flush();
        closed || removed
    }

    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        self.bridge.snapshots()
    }

    pub fn get_session(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.bridge.get(session_id).map(|e| e.inner.lock().snapshot())
    }

    /// Replace the backend adapter for a live session.
    pub async fn switch_adapter(
        &self,
        session_id: &str,
        adapter_name: &str,
        adapter_options: Option<Value>,
    ) -> Result<()> {
        self.bridge.disconnect_backend(session_id).await;
        self.supervisor.kill(session_id).await;
        self.connect_adapter(session_id, adapter_name, adapter_options, false, None)
            .await
    }

    /// Tear down the runtime: close every session, kill every process.
    pub async fn stop(&self) {
        for session_id in self.bridge.session_ids() {
            self.bridge.close_session(&session_id).await;
            self.supervisor.kill(&session_id).await;
        }
        let _ = self.store.flush();
        tracing::info!("coordinator stopped");
    }

    // ── Launch composition ───────────────────────────────────────────

    async fn connect_adapter(
        &self,
        session_id: &str,
        adapter_name: &str,
        adapter_options: Option<Value>,
        resume: bool,
        cwd: Option<&str>,
    ) -> Result<()> {
        let adapter = self.registry.get(adapter_name)?;
        let mut options: Map<String, Value> = adapter_options
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        if let Some(cwd) = cwd {
            options
                .entry("cwd".to_owned())
                .or_insert(Value::String(cwd.to_owned()));
        }

        let upstream_session_id = self
            .store
            .get(session_id)
            .and_then(|p| p.upstream_session_id);
        let resume = resume && upstream_session_id.is_some();

        match adapter_name {
            "claude" => {
                let mut args = vec![
                    "--sdk-url".to_owned(),
                    format!(
                        "ws://{}/v1/cli/ws/{session_id}",
                        self.config.server.bind
                    ),
                    "--input-format".to_owned(),
                    "stream-json".to_owned(),
                    "--output-format".to_owned(),
                    "stream-json".to_owned(),
                ];
                if resume {
                    if let Some(upstream) = &upstream_session_id {
                        args.push("--resume".to_owned());
                        args.push(upstream.clone());
                    }
                }
                self.supervisor.spawn(SpawnSpec {
                    key: session_id.to_owned(),
                    command: "claude".to_owned(),
                    args,
                    cwd: cwd.map(Into::into),
                    env: Vec::new(),
                    resume,
                    ready_marker: None,
                })?;
            }
            "opencode" => {
                let port = options
                    .get("port")
                    .and_then(Value::as_u64)
                    .unwrap_or(4096) as u16;
                let hostname = options
                    .get("hostname")
                    .and_then(Value::as_str)
                    .unwrap_or("127.0.0.1")
                    .to_owned();
                let mut spec = opencode::launch_spec(session_id, port, &hostname);
                spec.cwd = cwd.map(Into::into);
                self.supervisor.spawn(spec)?;
                self.supervisor.wait_ready(session_id).await?;
                options.insert(
                    "base_url".to_owned(),
                    Value::String(format!("http://{hostname}:{port}")),
                );
            }
            _ => {}
        }

        let opts = ConnectOptions {
            session_id: session_id.to_owned(),
            resume,
            upstream_session_id,
            adapter_options: options,
        };
        self.bridge
            .connect_backend(session_id, adapter.as_ref(), opts)
            .await
    }

    // ── Background listeners ─────────────────────────────────────────

    fn spawn_supervisor_listener(
        coordinator: &Arc<Self>,
        mut events: tokio::sync::mpsc::UnboundedReceiver<SupervisorEvent>,
    ) {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SupervisorEvent::ResumeFailed { key } => {
                        // Next launch must be a fresh spawn, not a retry.
                        coordinator.store.clear_upstream_id(&key);
                        let _ = coordinator.store.flush();
                        coordinator.hub.emit(BridgeEvent::BackendRelaunchNeeded {
                            session_id: key,
                            reason: "resume_failed".into(),
                        });
                    }
                    SupervisorEvent::Stderr { key, line } => {
                        tracing::debug!(session_id = %key, line = %line, "backend stderr");
                    }
                    SupervisorEvent::Exited { key, code, quick } => {
                        tracing::info!(
                            session_id = %key,
                            code = ?code,
                            quick,
                            "backend process exit observed"
                        );
                    }
                    SupervisorEvent::Error { key, message } => {
                        coordinator.hub.emit(BridgeEvent::Error {
                            session_id: key,
                            source: "supervisor".into(),
                            message,
                        });
                    }
                    _ => {}
                }
            }
        });
    }

    /// Close sessions with no activity for the configured window.  Disabled
    /// when the timeout is 0.
    fn spawn_idle_reaper(coordinator: &Arc<Self>) {
        let idle_ms = coordinator.config.sessions.idle_timeout_ms;
        if idle_ms == 0 {
            return;
        }
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let interval = std::time::Duration::from_millis((idle_ms / 2).max(1000));
            loop {
                tokio::time::sleep(interval).await;
                let cutoff = chrono::Utc::now().timestamp_millis() - idle_ms as i64;
                for snapshot in coordinator.list_sessions() {
                    if snapshot.last_activity < cutoff && snapshot.consumer_count == 0 {
                        tracing::info!(
                            session_id = %snapshot.session_id,
                            "reaping idle session"
                        );
                        coordinator.delete_session(&snapshot.session_id).await;
                    }
                }
            }
        });
    }

    fn spawn_event_listener(coordinator: &Arc<Self>) {
        let mut events = coordinator.hub.subscribe();
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(BridgeEvent::BackendSessionId {
                        session_id,
                        upstream_session_id,
                    }) => {
                        coordinator
                            .store
                            .set_upstream_id(&session_id, upstream_session_id);
                        let _ = coordinator.store.flush();
                    }
                    Ok(BridgeEvent::CapabilitiesReady { session_id, .. }) => {
                        coordinator.store.touch(&session_id);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}
