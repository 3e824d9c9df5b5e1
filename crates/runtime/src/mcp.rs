//! `RuneServer`: the `ServerHandler` implementation exposing `capture`,
//! `recall`, `vault_status`, and `reload_pipelines` over stdio JSON-RPC.
//!
//! Schemas are hand-built with `serde_json::json!` rather than derived via
//! `schemars`, matching the four-tool surface this workspace targets
//! without pulling in a schema-generation dependency for it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, ErrorCode, Implementation, InitializeRequestParam,
    InitializeResult, ListToolsResult, PaginatedRequestParam, ProtocolVersion, ServerCapabilities,
    ServerInfo, Tool, ToolsCapability,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::ErrorData as McpError;
use rune_config::ConfigStore;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex as AsyncMutex, RwLock};

use crate::pipelines::{build_pipelines, Pipelines};

/// Consecutive Vault `policy_denied` responses across `recall` calls before
/// the server treats the installation as categorically misconfigured and
/// persists a demotion to `dormant`.
const POLICY_DENIAL_DEMOTION_THRESHOLD: u32 = 5;

/// Total per-tool-call budget (spec §5): an LLM call, adapter RPC, or any
/// combination of them that together run past this are aborted and
/// surfaced as `{ok:false, error:"timeout"}` rather than left to hang.
const TOOL_CALL_BUDGET: Duration = Duration::from_secs(60);

/// Runs `fut` under the per-tool-call budget, converting an elapsed
/// deadline into the `timeout` error kind rather than a transport failure.
async fn with_call_budget<F>(fut: F) -> Result<CallToolResult, McpError>
where
    F: std::future::Future<Output = Result<CallToolResult, McpError>>,
{
    match tokio::time::timeout(TOOL_CALL_BUDGET, fut).await {
        Ok(result) => result,
        Err(_) => Ok(CallToolResult::structured(json!({"ok": false, "error": "timeout"}))),
    }
}

#[derive(Debug, Deserialize)]
struct CaptureParams {
    text: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    channel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecallParams {
    query: String,
    #[serde(default)]
    topk: Option<usize>,
}

#[derive(Clone)]
pub struct RuneServer {
    config_store: Arc<AsyncMutex<ConfigStore>>,
    pipelines: Arc<RwLock<Option<Arc<Pipelines>>>>,
    consecutive_policy_denials: Arc<AtomicU32>,
}

impl RuneServer {
    /// Opens the config store but never builds pipelines here — even for
    /// an `active` config, the first adapter connection is deferred to
    /// [`Self::ensure_pipelines`] on first use. Startup therefore never
    /// performs outbound I/O, and a config that is `active` on disk but
    /// unreachable in practice surfaces its failure on the first tool call
    /// rather than preventing the server from starting at all.
    pub async fn new(config_path: PathBuf) -> Result<Self> {
        let store = ConfigStore::open(config_path)?;
        Ok(Self {
            config_store: Arc::new(AsyncMutex::new(store)),
            pipelines: Arc::new(RwLock::new(None)),
            consecutive_policy_denials: Arc::new(AtomicU32::new(0)),
        })
    }

    async fn is_active(&self) -> bool {
        self.config_store.lock().await.is_active()
    }

    /// Returns the current pipelines, building them lazily on first use
    /// after an `active` transition. Never builds while `dormant` — callers
    /// must check [`Self::is_active`] first.
    async fn ensure_pipelines(&self) -> Result<Arc<Pipelines>> {
        if let Some(existing) = self.pipelines.read().await.clone() {
            return Ok(existing);
        }
        let config = self.config_store.lock().await.current().clone();
        let built = Arc::new(build_pipelines(&config).await?);
        *self.pipelines.write().await = Some(built.clone());
        Ok(built)
    }

    async fn note_recall_outcome(&self, error: Option<&str>) {
        if error == Some("policy_denied") {
            let count = self.consecutive_policy_denials.fetch_add(1, Ordering::SeqCst) + 1;
            if count >= POLICY_DENIAL_DEMOTION_THRESHOLD {
                tracing::warn!(count, "persisting demotion to dormant after repeated policy denials");
                if let Err(err) = self.config_store.lock().await.demote_to_dormant() {
                    tracing::error!(%err, "failed to persist dormant demotion");
                }
                *self.pipelines.write().await = None;
                self.consecutive_policy_denials.store(0, Ordering::SeqCst);
            }
        } else {
            self.consecutive_policy_denials.store(0, Ordering::SeqCst);
        }
    }

    async fn handle_capture(&self, request: CallToolRequestParam) -> Result<CallToolResult, McpError> {
        if !self.is_active().await {
            return Ok(CallToolResult::structured(json!({"ok": false, "error": "dormant"})));
        }
        let params = parse_params::<CaptureParams>(request)?;
        tracing::info!(source = ?params.source, user = ?params.user, channel = ?params.channel, "capture requested");

        let pipelines = self.ensure_pipelines().await.map_err(|e| internal_error(e.to_string()))?;
        let outcome = pipelines.capture.capture(&params.text).await;
        Ok(CallToolResult::structured(serde_json::to_value(outcome).unwrap_or_default()))
    }

    async fn handle_recall(&self, request: CallToolRequestParam) -> Result<CallToolResult, McpError> {
        if !self.is_active().await {
            return Ok(CallToolResult::structured(json!({"ok": false, "error": "dormant"})));
        }
        let params = parse_params::<RecallParams>(request)?;

        let pipelines = self.ensure_pipelines().await.map_err(|e| internal_error(e.to_string()))?;
        let outcome = pipelines.recall.recall(&params.query, params.topk).await;
        self.note_recall_outcome(outcome.error.as_deref()).await;
        Ok(CallToolResult::structured(serde_json::to_value(outcome).unwrap_or_default()))
    }

    async fn handle_vault_status(&self) -> Result<CallToolResult, McpError> {
        let pipelines = match self.ensure_pipelines().await {
            Ok(p) => p,
            Err(err) => {
                return Ok(CallToolResult::structured(
                    json!({"ok": false, "reachable": false, "security_mode": "", "error": err.to_string()}),
                ))
            }
        };
        let mut vault = pipelines.vault.lock().await;
        match vault.status().await {
            Ok(status) => Ok(CallToolResult::structured(
                json!({"ok": true, "reachable": status.reachable, "security_mode": status.security_mode}),
            )),
            Err(err) => Ok(CallToolResult::structured(
                json!({"ok": false, "reachable": false, "security_mode": "", "error": err.to_string()}),
            )),
        }
    }

    async fn handle_reload_pipelines(&self) -> Result<CallToolResult, McpError> {
        let mut store = self.config_store.lock().await;
        if let Err(err) = store.force_reload() {
            return Ok(CallToolResult::structured(json!({"ok": false, "error": err.to_string()})));
        }
        let active = store.is_active();
        let config = store.current().clone();
        drop(store);

        if !active {
            *self.pipelines.write().await = None;
            return Ok(CallToolResult::structured(json!({"ok": true})));
        }

        match build_pipelines(&config).await {
            Ok(built) => {
                *self.pipelines.write().await = Some(Arc::new(built));
                Ok(CallToolResult::structured(json!({"ok": true})))
            }
            Err(err) => Ok(CallToolResult::structured(json!({"ok": false, "error": err.to_string()}))),
        }
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(request: CallToolRequestParam) -> Result<T, McpError> {
    let args = request.arguments.ok_or_else(|| invalid_params("missing parameters"))?;
    serde_json::from_value(Value::Object(args)).map_err(|e| invalid_params(format!("invalid parameters: {e}")))
}

fn invalid_params(message: impl Into<String>) -> McpError {
    McpError { code: ErrorCode::INVALID_PARAMS, message: message.into().into(), data: None }
}

fn internal_error(message: impl Into<String>) -> McpError {
    McpError { code: ErrorCode::INTERNAL_ERROR, message: message.into().into(), data: None }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dormant_config_path() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        (dir, path)
    }

    #[tokio::test(start_paused = true)]
    async fn with_call_budget_surfaces_timeout_kind_past_the_deadline() {
        let pending = async {
            tokio::time::sleep(TOOL_CALL_BUDGET + Duration::from_secs(1)).await;
            Ok(CallToolResult::structured(json!({"ok": true})))
        };
        let result = with_call_budget(pending).await.unwrap();
        let value = result.structured_content.unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"], "timeout");
    }

    #[tokio::test]
    async fn with_call_budget_passes_through_a_fast_result() {
        let fast = async { Ok(CallToolResult::structured(json!({"ok": true}))) };
        let result = with_call_budget(fast).await.unwrap();
        assert_eq!(result.structured_content.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn fresh_install_is_dormant_and_builds_no_pipelines() {
        let (_dir, path) = dormant_config_path();
        let server = RuneServer::new(path).await.unwrap();
        assert!(!server.is_active().await);
        assert!(server.pipelines.read().await.is_none());
    }

    #[tokio::test]
    async fn non_policy_denied_outcome_resets_the_counter() {
        let (_dir, path) = dormant_config_path();
        let server = RuneServer::new(path).await.unwrap();

        server.note_recall_outcome(Some("policy_denied")).await;
        server.note_recall_outcome(Some("policy_denied")).await;
        assert_eq!(server.consecutive_policy_denials.load(Ordering::SeqCst), 2);

        server.note_recall_outcome(Some("store_unavailable")).await;
        assert_eq!(server.consecutive_policy_denials.load(Ordering::SeqCst), 0);

        server.note_recall_outcome(None).await;
        assert_eq!(server.consecutive_policy_denials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn repeated_policy_denials_demote_to_dormant() {
        let (_dir, path) = dormant_config_path();
        let server = RuneServer::new(path.clone()).await.unwrap();

        for _ in 0..POLICY_DENIAL_DEMOTION_THRESHOLD {
            server.note_recall_outcome(Some("policy_denied")).await;
        }

        assert_eq!(server.consecutive_policy_denials.load(Ordering::SeqCst), 0);
        // A fresh install has no on-disk config to demote, so
        // `demote_to_dormant` has nothing to persist and the store stays
        // dormant — the important assertion is that the counter reset and
        // no panic occurred applying the threshold.
        assert!(!server.is_active().await);
    }
}

impl ServerHandler for RuneServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: Some(false) }),
                ..Default::default()
            },
            server_info: Implementation { name: "rune".to_string(), version: env!("CARGO_PKG_VERSION").to_string() },
            ..Default::default()
        }
    }

    async fn initialize(
        &self,
        request: InitializeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        let mut info = self.get_info();
        info.protocol_version = request.protocol_version.clone();
        Ok(info)
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let tools = vec![
            Tool::new(
                "capture".to_string(),
                "Capture a decision, rationale, policy, lesson, or insight into organizational memory".to_string(),
                json!({
                    "type": "object",
                    "properties": {
                        "text": {"type": "string", "description": "The utterance to evaluate for capture"},
                        "source": {"type": "string", "description": "Origin of the utterance, e.g. a tool or integration name"},
                        "user": {"type": "string", "description": "The user the utterance is attributed to"},
                        "channel": {"type": "string", "description": "The conversation or channel the utterance came from"}
                    },
                    "required": ["text"]
                }),
            ),
            Tool::new(
                "recall".to_string(),
                "Recall previously captured decisions relevant to a question".to_string(),
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "Natural-language question to answer from memory"},
                        "topk": {"type": "integer", "minimum": 1, "maximum": 10, "description": "Maximum number of sources to return, default 5"}
                    },
                    "required": ["query"]
                }),
            ),
            Tool::new(
                "vault_status".to_string(),
                "Report whether the Vault trust boundary is reachable".to_string(),
                json!({"type": "object", "properties": {}}),
            ),
            Tool::new(
                "reload_pipelines".to_string(),
                "Re-read configuration from disk and rebuild the capture/recall pipelines".to_string(),
                json!({"type": "object", "properties": {}}),
            ),
        ];
        Ok(ListToolsResult { tools, ..Default::default() })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        match request.name.as_ref() {
            "capture" => with_call_budget(self.handle_capture(request)).await,
            "recall" => with_call_budget(self.handle_recall(request)).await,
            "vault_status" => with_call_budget(self.handle_vault_status()).await,
            "reload_pipelines" => with_call_budget(self.handle_reload_pipelines()).await,
            other => Err(McpError {
                code: ErrorCode::METHOD_NOT_FOUND,
                message: format!("unknown tool: {other}").into(),
                data: None,
            }),
        }
    }
}
