use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::trace;

use crate::frontend::Frontend;

/// Chunk kinds the cache coalesces. A run of same-kind chunks is replayed as
/// a single notification carrying the concatenated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkKind {
    AgentMessage,
    AgentThought,
}

impl ChunkKind {
    fn from_update(kind: &str) -> Option<Self> {
        match kind {
            "agent_message_chunk" => Some(Self::AgentMessage),
            "agent_thought_chunk" => Some(Self::AgentThought),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::AgentMessage => "agent_message_chunk",
            Self::AgentThought => "agent_thought_chunk",
        }
    }
}

/// Accumulates the trailing run of same-kind chunk notifications.
#[derive(Default)]
struct ChunkRun {
    kind: Option<ChunkKind>,
    session_id: String,
    text: String,
}

impl ChunkRun {
    fn render(&self) -> Option<String> {
        let kind = self.kind?;
        Some(
            json!({
                "jsonrpc": "2.0",
                "method": "session/update",
                "params": {
                    "sessionId": self.session_id,
                    "update": {
                        "sessionUpdate": kind.as_str(),
                        "content": {"type": "text", "text": self.text},
                    },
                },
            })
            .to_string(),
        )
    }
}

#[derive(Default)]
struct Slots {
    meta: Option<String>,
    init_resp: Option<String>,
    new_resp: Option<String>,
    updates: Vec<String>,
    pending_permission: Option<String>,
    run: ChunkRun,
}

impl Slots {
    fn flush_run(&mut self) {
        if let Some(line) = self.run.render() {
            self.updates.push(line);
        }
        self.run = ChunkRun::default();
    }
}

/// Ordered record of the session, kept for replaying to late-joining
/// frontends. All slots and the chunk accumulator live under one mutex.
#[derive(Default)]
pub struct Cache {
    slots: Mutex<Slots>,
}

// The fields addUpdate needs from a session/update notification. Anything
// that doesn't parse into this shape is cached verbatim.
#[derive(Deserialize, Default)]
struct UpdateNotification {
    #[serde(default)]
    params: UpdateParams,
}

#[derive(Deserialize, Default)]
struct UpdateParams {
    #[serde(rename = "sessionId", default)]
    session_id: String,
    #[serde(default)]
    update: UpdateBody,
}

#[derive(Deserialize, Default)]
struct UpdateBody {
    #[serde(rename = "sessionUpdate", default)]
    session_update: String,
    #[serde(default)]
    content: UpdateContent,
}

#[derive(Deserialize, Default)]
struct UpdateContent {
    #[serde(default)]
    text: Option<String>,
}

fn classify_chunk(line: &str) -> Option<(ChunkKind, String, String)> {
    let notif: UpdateNotification = serde_json::from_str(line).ok()?;
    let kind = ChunkKind::from_update(&notif.params.update.session_update)?;
    let text = notif.params.update.content.text?;
    Some((kind, notif.params.session_id, text))
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_meta(&self, line: &str) {
        self.slots.lock().await.meta = Some(line.to_owned());
    }

    pub async fn set_init_response(&self, line: &str) {
        self.slots.lock().await.init_resp = Some(line.to_owned());
    }

    pub async fn set_new_response(&self, line: &str) {
        self.slots.lock().await.new_resp = Some(line.to_owned());
    }

    pub async fn set_pending_permission(&self, line: &str) {
        self.slots.lock().await.pending_permission = Some(line.to_owned());
    }

    pub async fn clear_pending_permission(&self) {
        self.slots.lock().await.pending_permission = None;
    }

    /// Append a notification to the session record. Runs of same-kind agent
    /// text/thought chunks collect in the accumulator; anything else flushes
    /// the accumulator first and is stored verbatim.
    pub async fn add_update(&self, line: &str) {
        let mut slots = self.slots.lock().await;
        match classify_chunk(line) {
            Some((kind, session_id, text)) => {
                if slots.run.kind == Some(kind) {
                    slots.run.text.push_str(&text);
                } else {
                    slots.flush_run();
                    slots.run = ChunkRun {
                        kind: Some(kind),
                        session_id,
                        text,
                    };
                }
            }
            None => {
                slots.flush_run();
                slots.updates.push(line.to_owned());
            }
        }
    }

    /// Deliver the cached history to a newly attached frontend: meta, the
    /// initialize response, the session/new response, all updates in order,
    /// then any unresolved permission request. An in-progress chunk run is
    /// rendered into the snapshot only; the live accumulator keeps absorbing
    /// chunks so a run is never split across a join. Sends happen outside
    /// the lock, so replay cannot block concurrent writers.
    pub async fn replay(&self, frontend: &Frontend) {
        let lines = {
            let slots = self.slots.lock().await;
            let mut lines = Vec::with_capacity(slots.updates.len() + 5);
            if let Some(meta) = &slots.meta {
                lines.push(meta.clone());
            }
            if let Some(init) = &slots.init_resp {
                lines.push(init.clone());
            }
            if let Some(new) = &slots.new_resp {
                lines.push(new.clone());
            }
            lines.extend(slots.updates.iter().cloned());
            if let Some(run) = slots.run.render() {
                lines.push(run);
            }
            if let Some(permission) = &slots.pending_permission {
                lines.push(permission.clone());
            }
            lines
        };

        trace!("replaying {} lines to frontend {}", lines.len(), frontend.id);
        for line in &lines {
            frontend.send(line).await;
        }
    }
}
