use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, info, warn};

use crate::cache::Cache;
use crate::envelope::{restore_id, rewrite_id, Envelope, MessageKind, MAX_LINE_BYTES};
use crate::frontend::{Frontend, FrontendMessage};

pub type AgentReader = Box<dyn AsyncRead + Send + Unpin>;
pub type AgentWriter = Box<dyn AsyncWrite + Send + Unpin>;

const FRONTEND_CHANNEL_CAPACITY: usize = 64;

/// A request we forwarded to the agent under a proxy-allocated id, kept so
/// the response can be routed back to its sender with the original id.
struct PendingRequest {
    frontend: Arc<Frontend>,
    /// The caller's id exactly as it appeared on the wire.
    original_id: String,
    method: String,
    /// Original request params, retained for notification synthesis.
    params: Option<String>,
}

/// An agent-originated request whose id we are waiting to see echoed back by
/// some frontend. First response wins; the rest are dropped.
struct PendingReverse {
    permission: bool,
}

/// The core multiplexer. One loop reads from the agent and fans out to
/// frontends; a second loop consumes the merged frontend channel and forwards
/// to the agent.
pub struct Proxy {
    agent_in: Mutex<AgentWriter>,
    agent_out: Mutex<Option<AgentReader>>,
    agent_dead: AtomicBool,

    frontends: Mutex<Vec<Arc<Frontend>>>,

    next_id: AtomicI64,
    pending: DashMap<i64, PendingRequest>,
    pending_reverse: DashMap<String, PendingReverse>,

    cache: Arc<Cache>,

    from_frontends_tx: mpsc::Sender<FrontendMessage>,
    from_frontends_rx: Mutex<Option<mpsc::Receiver<FrontendMessage>>>,
}

impl Proxy {
    pub fn new(agent_in: AgentWriter, agent_out: AgentReader, cache: Arc<Cache>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(FRONTEND_CHANNEL_CAPACITY);
        Arc::new(Self {
            agent_in: Mutex::new(agent_in),
            agent_out: Mutex::new(Some(agent_out)),
            agent_dead: AtomicBool::new(false),
            frontends: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            pending: DashMap::new(),
            pending_reverse: DashMap::new(),
            cache,
            from_frontends_tx: tx,
            from_frontends_rx: Mutex::new(Some(rx)),
        })
    }

    /// Register a frontend: start its read loop, watch for disconnect, and
    /// replay cached history if it joined late.
    pub async fn add_frontend(self: &Arc<Self>, frontend: Arc<Frontend>) {
        self.frontends.lock().await.push(frontend.clone());

        tokio::spawn(frontend.clone().read_lines(self.from_frontends_tx.clone()));

        let proxy = self.clone();
        let watched = frontend.clone();
        tokio::spawn(async move {
            watched.closed().await;
            proxy.remove_frontend(&watched).await;
        });

        // Replay may block on the peer's writer, so it runs on its own task.
        if !frontend.primary {
            let cache = self.cache.clone();
            tokio::spawn(async move { cache.replay(&frontend).await });
        }
    }

    async fn remove_frontend(&self, frontend: &Frontend) {
        self.frontends.lock().await.retain(|f| f.id != frontend.id);
        debug!("frontend {} removed", frontend.id);
    }

    /// Run both read loops. Resolves once the agent's outbound stream has
    /// ended and all pending requests have been drained.
    pub async fn run(self: Arc<Self>) {
        let receiver = self.from_frontends_rx.lock().await.take();
        let Some(receiver) = receiver else {
            error!("proxy already running");
            return;
        };
        let proxy = self.clone();
        tokio::spawn(async move { proxy.read_from_frontends(receiver).await });
        self.read_from_agent().await;
    }

    // ------------------------------------------------------------------
    // Agent-read loop
    // ------------------------------------------------------------------

    async fn read_from_agent(&self) {
        let reader = self.agent_out.lock().await.take();
        let Some(reader) = reader else {
            error!("agent read loop already started");
            return;
        };
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        while let Some(item) = lines.next().await {
            let line = match item {
                Ok(line) => line,
                Err(e) => {
                    // Oversize or broken stream; fatal for the agent side.
                    error!("agent stream: {}", e);
                    break;
                }
            };
            let env = match Envelope::parse(&line) {
                Ok(env) => env,
                Err(e) => {
                    warn!("agent: bad json: {}", e);
                    continue;
                }
            };
            match env.kind() {
                MessageKind::Notification => {
                    if env.method.as_deref() == Some("session/update") {
                        self.cache.add_update(&line).await;
                    }
                    self.broadcast(&line).await;
                }
                MessageKind::Response => self.route_response(&env, &line).await,
                MessageKind::Request => self.route_reverse_call(&env, &line).await,
                MessageKind::Invalid => warn!("agent: unclassifiable message"),
            }
        }

        // Agent exited: mark dead, then fail every outstanding request so no
        // frontend is left waiting on a response that can never arrive.
        self.agent_dead.store(true, Ordering::SeqCst);
        info!("agent exited, draining pending requests");
        let open: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for proxy_id in open {
            if let Some((_, pr)) = self.pending.remove(&proxy_id) {
                debug!(
                    "error response for pending request {} (method {}) to frontend {}",
                    proxy_id, pr.method, pr.frontend.id
                );
                pr.frontend.send(&agent_exited_response(&pr.original_id)).await;
            }
        }
    }

    /// Route an agent response back to the frontend that sent the original
    /// request, with the caller's id restored.
    async fn route_response(&self, env: &Envelope, line: &str) {
        let Some(raw_id) = env.raw_id() else { return };
        let proxy_id: i64 = match raw_id.parse() {
            Ok(id) => id,
            Err(_) => {
                // Not an id we allocated; hand it to the primary as a courtesy.
                warn!("agent response with non-numeric id, forwarding to primary");
                self.send_to_primary(line).await;
                return;
            }
        };

        let Some((_, pr)) = self.pending.remove(&proxy_id) else {
            warn!("agent response for unknown id {}", proxy_id);
            return;
        };

        match pr.method.as_str() {
            // initialize and session/new responses are cached for replay,
            // with the id normalized so every joiner sees the same line.
            "initialize" => match rewrite_id(line, 0) {
                Ok(normalized) => self.cache.set_init_response(&normalized).await,
                Err(e) => warn!("cache initialize response: {}", e),
            },
            "session/new" => match rewrite_id(line, 0) {
                Ok(normalized) => self.cache.set_new_response(&normalized).await,
                Err(e) => warn!("cache session/new response: {}", e),
            },
            // Other frontends only see streaming notifications, so tell them
            // the turn is over.
            "session/prompt" => self.synthesize_turn_complete(line, &pr).await,
            // The agent doesn't announce mode changes; synthesize one from
            // the stored request params.
            "session/set_mode" => self.synthesize_mode_change(&pr).await,
            _ => {}
        }

        match restore_id(line, &pr.original_id) {
            Ok(restored) => pr.frontend.send(&restored).await,
            Err(e) => error!("failed to restore id: {}", e),
        }
    }

    /// Route an agent-initiated request. fs/* and terminal/* need real
    /// filesystem/terminal authority and go to the primary only; everything
    /// else is broadcast and arbitrated first-response-wins.
    async fn route_reverse_call(&self, env: &Envelope, line: &str) {
        let method = env.method.as_deref().unwrap_or_default();
        let permission = method == "session/request_permission";
        if let Some(raw_id) = env.raw_id() {
            self.pending_reverse
                .insert(raw_id.to_owned(), PendingReverse { permission });
        }
        if method.starts_with("fs/") || method.starts_with("terminal/") {
            self.send_to_primary(line).await;
        } else {
            if permission {
                // Late joiners must see the unresolved prompt.
                self.cache.set_pending_permission(line).await;
            }
            self.broadcast(line).await;
        }
    }

    // ------------------------------------------------------------------
    // Frontend-read loop
    // ------------------------------------------------------------------

    async fn read_from_frontends(&self, mut receiver: mpsc::Receiver<FrontendMessage>) {
        while let Some(msg) = receiver.recv().await {
            let env = match Envelope::parse(&msg.line) {
                Ok(env) => env,
                Err(e) => {
                    warn!("frontend {}: bad json: {}", msg.frontend.id, e);
                    continue;
                }
            };
            match env.kind() {
                MessageKind::Request => {
                    self.handle_frontend_request(&msg.frontend, &env, &msg.line)
                        .await
                }
                MessageKind::Notification => {
                    if let Err(e) = self.send_to_agent(&msg.line).await {
                        warn!(
                            "frontend {}: notification to agent failed: {}",
                            msg.frontend.id, e
                        );
                    }
                }
                MessageKind::Response => {
                    self.handle_reverse_response(&msg.frontend, &env, &msg.line)
                        .await
                }
                MessageKind::Invalid => {
                    warn!("frontend {}: unclassifiable message", msg.frontend.id)
                }
            }
        }
    }

    /// Forward a frontend request to the agent under a fresh proxy id.
    async fn handle_frontend_request(
        &self,
        frontend: &Arc<Frontend>,
        env: &Envelope,
        line: &str,
    ) {
        let proxy_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let original_id = env.raw_id().unwrap_or("null").to_owned();
        let method = env.method.clone().unwrap_or_default();

        self.pending.insert(
            proxy_id,
            PendingRequest {
                frontend: frontend.clone(),
                original_id: original_id.clone(),
                method: method.clone(),
                params: env.params.as_deref().map(|p| p.get().to_owned()),
            },
        );

        let rewritten = match rewrite_id(line, proxy_id) {
            Ok(rewritten) => rewritten,
            Err(e) => {
                error!("failed to rewrite id: {}", e);
                self.pending.remove(&proxy_id);
                return;
            }
        };

        // Other frontends (and the replay cache) see what was typed; the
        // sender's UI already renders its own input.
        if method == "session/prompt" {
            self.synthesize_user_message(env, frontend).await;
        }

        if let Err(e) = self.send_to_agent(&rewritten).await {
            warn!("frontend {}: send to agent failed: {}", frontend.id, e);
            self.pending.remove(&proxy_id);
            frontend.send(&agent_exited_response(&original_id)).await;
        }
    }

    /// A frontend answered a reverse call. The first response wins and is
    /// forwarded; duplicates from other frontends are dropped.
    async fn handle_reverse_response(
        &self,
        frontend: &Arc<Frontend>,
        env: &Envelope,
        line: &str,
    ) {
        let Some(raw_id) = env.raw_id() else { return };
        let Some((_, call)) = self.pending_reverse.remove(raw_id) else {
            debug!(
                "frontend {}: duplicate reverse response dropped",
                frontend.id
            );
            return;
        };
        if call.permission {
            self.cache.clear_pending_permission().await;
        }
        if let Err(e) = self.send_to_agent(line).await {
            warn!("frontend {}: response to agent failed: {}", frontend.id, e);
        }
    }

    // ------------------------------------------------------------------
    // Synthesis
    // ------------------------------------------------------------------

    /// Turn the content blocks of a session/prompt request into
    /// user_message_chunk notifications for every frontend but the sender.
    async fn synthesize_user_message(&self, env: &Envelope, sender: &Arc<Frontend>) {
        #[derive(Deserialize)]
        struct PromptParams {
            #[serde(rename = "sessionId", default)]
            session_id: String,
            #[serde(default)]
            prompt: Vec<serde_json::Value>,
        }

        let Some(raw_params) = env.params.as_deref() else { return };
        let params: PromptParams = match serde_json::from_str(raw_params.get()) {
            Ok(params) => params,
            Err(e) => {
                warn!("synthesize user message: bad params: {}", e);
                return;
            }
        };

        for block in params.prompt {
            let line = json!({
                "jsonrpc": "2.0",
                "method": "session/update",
                "params": {
                    "sessionId": params.session_id,
                    "update": {"sessionUpdate": "user_message_chunk", "content": block},
                },
            })
            .to_string();
            self.cache.add_update(&line).await;
            self.broadcast_except(&line, Some(sender)).await;
        }
    }

    /// Broadcast a turn_complete notification built from a session/prompt
    /// response, skipping the frontend that ran the prompt.
    async fn synthesize_turn_complete(&self, response_line: &str, pr: &PendingRequest) {
        #[derive(Deserialize, Default)]
        struct PromptResult {
            #[serde(rename = "stopReason", default)]
            stop_reason: String,
            #[serde(rename = "sessionId", default)]
            session_id: String,
        }
        #[derive(Deserialize, Default)]
        struct PromptResponse {
            #[serde(default)]
            result: PromptResult,
        }

        let Ok(resp) = serde_json::from_str::<PromptResponse>(response_line) else {
            return;
        };
        if resp.result.stop_reason.is_empty() {
            return;
        }

        let line = json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": {
                "sessionId": resp.result.session_id,
                "update": {
                    "sessionUpdate": "turn_complete",
                    "stopReason": resp.result.stop_reason,
                },
            },
        })
        .to_string();
        self.cache.add_update(&line).await;
        self.broadcast_except(&line, Some(&pr.frontend)).await;
    }

    /// Broadcast a current_mode_update notification built from the stored
    /// session/set_mode request params.
    async fn synthesize_mode_change(&self, pr: &PendingRequest) {
        #[derive(Deserialize)]
        struct SetModeParams {
            #[serde(rename = "sessionId", default)]
            session_id: String,
            #[serde(rename = "modeId", default)]
            mode_id: String,
        }

        let Some(raw_params) = pr.params.as_deref() else { return };
        let params: SetModeParams = match serde_json::from_str(raw_params) {
            Ok(params) => params,
            Err(e) => {
                warn!("synthesize mode change: bad params: {}", e);
                return;
            }
        };

        let line = json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": {
                "sessionId": params.session_id,
                "update": {
                    "sessionUpdate": "current_mode_update",
                    "currentModeId": params.mode_id,
                },
            },
        })
        .to_string();
        self.cache.add_update(&line).await;
        self.broadcast_except(&line, Some(&pr.frontend)).await;
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Write one JSON line to the agent's stdin. Fails once the agent is dead.
    async fn send_to_agent(&self, line: &str) -> Result<()> {
        if self.agent_dead.load(Ordering::SeqCst) {
            return Err(anyhow!("agent process exited"));
        }
        let mut writer = self.agent_in.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn broadcast(&self, line: &str) {
        self.broadcast_except(line, None).await;
    }

    /// Fan a line out to every frontend except `except`. The membership lock
    /// is released before the first send so a slow peer never holds it.
    async fn broadcast_except(&self, line: &str, except: Option<&Arc<Frontend>>) {
        let targets: Vec<Arc<Frontend>> = self.frontends.lock().await.to_vec();
        let skip = except.map(|f| f.id);
        for frontend in targets {
            if Some(frontend.id) != skip {
                frontend.send(line).await;
            }
        }
    }

    async fn send_to_primary(&self, line: &str) {
        let primary = self.frontends.lock().await.iter().find(|f| f.primary).cloned();
        match primary {
            Some(frontend) => frontend.send(line).await,
            None => warn!("no primary frontend for reverse call"),
        }
    }
}

/// The error response every caller gets for a request the agent can no
/// longer answer, carrying the caller's original id.
fn agent_exited_response(original_id: &str) -> String {
    let line = json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": {"code": -32603, "message": "Agent process exited"},
    })
    .to_string();
    restore_id(&line, original_id).unwrap_or(line)
}
