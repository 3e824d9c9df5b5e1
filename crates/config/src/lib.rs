use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Plugin activation gate. Fresh installs start `dormant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Active,
    Dormant,
}

impl Default for PluginState {
    fn default() -> Self {
        PluginState::Dormant
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub endpoint: String,
    pub token: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            token: String::new(),
        }
    }
}

impl VaultConfig {
    pub fn is_populated(&self) -> bool {
        !self.endpoint.trim().is_empty() && !self.token.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvectorConfig {
    pub endpoint: String,
    pub api_key: String,
    pub index: String,
}

impl Default for EnvectorConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            index: "rune".to_string(),
        }
    }
}

impl EnvectorConfig {
    pub fn is_populated(&self) -> bool {
        !self.endpoint.trim().is_empty() && !self.api_key.trim().is_empty()
    }
}

/// Known LLM providers. `auto` is a configuration-time-only token — it must
/// be resolved via [`LlmConfig::resolve`] before a client is constructed; it
/// never appears as a runtime provider value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    Anthropic,
    Openai,
    Google,
}

impl LlmProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProviderKind::Anthropic => "anthropic",
            LlmProviderKind::Openai => "openai",
            LlmProviderKind::Google => "google",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub tier2_provider: String,
    pub anthropic_api_key: String,
    pub anthropic_model: String,
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_tier2_model: String,
    pub google_api_key: String,
    pub google_model: String,
    pub google_tier2_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "auto".to_string(),
            tier2_provider: String::new(),
            anthropic_api_key: String::new(),
            anthropic_model: "claude-3-5-sonnet-latest".to_string(),
            openai_api_key: String::new(),
            openai_model: "gpt-4o-mini".to_string(),
            openai_tier2_model: "gpt-4o-mini".to_string(),
            google_api_key: String::new(),
            google_model: "gemini-1.5-pro".to_string(),
            google_tier2_model: "gemini-1.5-flash".to_string(),
        }
    }
}

impl LlmConfig {
    /// Does at least one provider key exist? Required for `state=active`.
    pub fn has_any_key(&self) -> bool {
        !self.anthropic_api_key.trim().is_empty()
            || !self.openai_api_key.trim().is_empty()
            || !self.google_api_key.trim().is_empty()
    }

    /// Resolve `self.provider` (which may be the configuration-time token
    /// `"auto"`) into a concrete [`LlmProviderKind`]. `auto` picks the first
    /// provider with a non-empty key, in Anthropic > OpenAI > Google order.
    /// Returns `None` when no provider can be resolved (surfaced by callers
    /// as `llm_unavailable`).
    pub fn resolve(&self, provider: &str) -> Option<LlmProviderKind> {
        match provider {
            "anthropic" => Some(LlmProviderKind::Anthropic),
            "openai" => Some(LlmProviderKind::Openai),
            "google" => Some(LlmProviderKind::Google),
            "auto" | "" => {
                if !self.anthropic_api_key.trim().is_empty() {
                    Some(LlmProviderKind::Anthropic)
                } else if !self.openai_api_key.trim().is_empty() {
                    Some(LlmProviderKind::Openai)
                } else if !self.google_api_key.trim().is_empty() {
                    Some(LlmProviderKind::Google)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn resolve_primary(&self) -> Option<LlmProviderKind> {
        self.resolve(&self.provider)
    }

    pub fn resolve_tier2(&self) -> Option<LlmProviderKind> {
        self.resolve(&self.tier2_provider)
            .or_else(|| self.resolve_primary())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScribeConfig {
    pub tier2_enabled: bool,
    pub similarity_threshold: f32,
    pub duplicate_threshold: f32,
    pub auto_capture_threshold: f32,
    pub tier1_cache_size: usize,
}

impl Default for ScribeConfig {
    fn default() -> Self {
        Self {
            tier2_enabled: true,
            similarity_threshold: 0.35,
            duplicate_threshold: 0.95,
            auto_capture_threshold: 0.8,
            tier1_cache_size: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    pub topk: usize,
    pub confidence_threshold: f32,
}

impl Default for RetrieverConfig {
    /// `topk` default of 5 matches `recall`'s own documented default
    /// (spec §4.3 step 1: "Validate topk ∈ [1,10]; default 5") — an
    /// operator who wants the on-disk example's `topk: 10` gets it by
    /// setting it explicitly, same as any other config override.
    fn default() -> Self {
        Self {
            topk: 5,
            confidence_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub state: PluginState,
    pub vault: VaultConfig,
    pub envector: EnvectorConfig,
    pub llm: LlmConfig,
    pub scribe: ScribeConfig,
    pub retriever: RetrieverConfig,
}

/// Which fields on a freshly-loaded [`AppConfig`] were populated from an
/// environment variable rather than the on-disk file. `save_to` must not
/// persist these back.
#[derive(Debug, Clone, Default)]
struct EnvSourced {
    llm_provider: bool,
    llm_tier2_provider: bool,
    anthropic_api_key: bool,
    openai_api_key: bool,
    google_api_key: bool,
    envector_endpoint: bool,
    envector_api_key: bool,
    vault_endpoint: bool,
    vault_token: bool,
}

impl AppConfig {
    /// Read the config file at `path` if present, falling back to defaults,
    /// then apply environment variable overrides. Missing keys in
    /// the on-disk JSON take documented defaults via `#[serde(default)]`.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading config at {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing config JSON at {}", path.display()))?
        } else {
            Self::default()
        };

        apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Write the config back to `path` as pretty JSON, masking any field
    /// that was sourced from the environment at load time, and restricting
    /// file permissions to user-only read/write (0600 on POSIX).
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut sanitized = self.clone();
        let env = detect_env_sourced();
        if env.llm_provider {
            sanitized.llm.provider = "auto".to_string();
        }
        if env.llm_tier2_provider {
            sanitized.llm.tier2_provider = String::new();
        }
        if env.anthropic_api_key {
            sanitized.llm.anthropic_api_key = String::new();
        }
        if env.openai_api_key {
            sanitized.llm.openai_api_key = String::new();
        }
        if env.google_api_key {
            sanitized.llm.google_api_key = String::new();
        }
        if env.envector_endpoint {
            sanitized.envector.endpoint = String::new();
        }
        if env.envector_api_key {
            sanitized.envector.api_key = String::new();
        }
        if env.vault_endpoint {
            sanitized.vault.endpoint = String::new();
        }
        if env.vault_token {
            sanitized.vault.token = String::new();
        }

        let rendered = serde_json::to_string_pretty(&sanitized)?;
        fs::write(path, rendered)?;
        set_user_only_permissions(path)?;
        Ok(())
    }

    /// `state = active` requires Vault, enVector,
    /// and at least one LLM provider key to be populated. A config on disk
    /// may carry `state: "active"` while actually failing this invariant
    /// (e.g. a key was wiped externally); callers should treat that as
    /// `dormant` rather than trusting the stale flag.
    pub fn is_active(&self) -> bool {
        self.state == PluginState::Active
            && self.vault.is_populated()
            && self.envector.is_populated()
            && self.llm.has_any_key()
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "rune")
            .context("could not determine a user config directory")?;
        Ok(dirs.config_dir().join("config.json"))
    }
}

fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(v) = env::var("RUNE_LLM_PROVIDER") {
        if !v.is_empty() {
            config.llm.provider = v;
        }
    }
    if let Ok(v) = env::var("RUNE_TIER2_LLM_PROVIDER") {
        if !v.is_empty() {
            config.llm.tier2_provider = v;
        }
    }
    if let Ok(v) = env::var("ANTHROPIC_API_KEY") {
        if !v.is_empty() {
            config.llm.anthropic_api_key = v;
        }
    }
    if let Ok(v) = env::var("OPENAI_API_KEY") {
        if !v.is_empty() {
            config.llm.openai_api_key = v;
        }
    }
    if let Ok(v) = env::var("GOOGLE_API_KEY").or_else(|_| env::var("GEMINI_API_KEY")) {
        if !v.is_empty() {
            config.llm.google_api_key = v;
        }
    }
    if let Ok(v) = env::var("ENVECTOR_ENDPOINT") {
        if !v.is_empty() {
            config.envector.endpoint = v;
        }
    }
    if let Ok(v) = env::var("ENVECTOR_API_KEY") {
        if !v.is_empty() {
            config.envector.api_key = v;
        }
    }
    if let Ok(v) = env::var("RUNEVAULT_ENDPOINT") {
        if !v.is_empty() {
            config.vault.endpoint = v;
        }
    }
    if let Ok(v) = env::var("RUNEVAULT_TOKEN") {
        if !v.is_empty() {
            config.vault.token = v;
        }
    }
}

fn detect_env_sourced() -> EnvSourced {
    EnvSourced {
        llm_provider: env::var("RUNE_LLM_PROVIDER").map(|v| !v.is_empty()).unwrap_or(false),
        llm_tier2_provider: env::var("RUNE_TIER2_LLM_PROVIDER").map(|v| !v.is_empty()).unwrap_or(false),
        anthropic_api_key: env::var("ANTHROPIC_API_KEY").map(|v| !v.is_empty()).unwrap_or(false),
        openai_api_key: env::var("OPENAI_API_KEY").map(|v| !v.is_empty()).unwrap_or(false),
        google_api_key: env::var("GOOGLE_API_KEY")
            .or_else(|_| env::var("GEMINI_API_KEY"))
            .map(|v| !v.is_empty())
            .unwrap_or(false),
        envector_endpoint: env::var("ENVECTOR_ENDPOINT").map(|v| !v.is_empty()).unwrap_or(false),
        envector_api_key: env::var("ENVECTOR_API_KEY").map(|v| !v.is_empty()).unwrap_or(false),
        vault_endpoint: env::var("RUNEVAULT_ENDPOINT").map(|v| !v.is_empty()).unwrap_or(false),
        vault_token: env::var("RUNEVAULT_TOKEN").map(|v| !v.is_empty()).unwrap_or(false),
    }
}

#[cfg(unix)]
fn set_user_only_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_user_only_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Read-mostly cache over the on-disk config, keyed by file `mtime` (spec
/// §3, §4.7). `reload()` re-reads the file only if its modification time
/// has changed since the last read.
pub struct ConfigStore {
    path: PathBuf,
    cached: AppConfig,
    last_mtime: Option<SystemTime>,
}

impl ConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cached = AppConfig::load_from(&path)?;
        let last_mtime = file_mtime(&path);
        Ok(Self {
            path,
            cached,
            last_mtime,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> &AppConfig {
        &self.cached
    }

    /// Refreshes the cache from disk if the file's `mtime` has changed
    /// (spec §3, §4.7: "file `mtime` change invalidates cache") before
    /// reporting the current `state`, so an external edit that flips
    /// `state` to `dormant` (or clears a required key) is observed without
    /// waiting for an explicit `reload_pipelines`. A reload failure (e.g. a
    /// transiently invalid file mid-write) is logged and the previously
    /// cached state is kept rather than propagated.
    pub fn is_active(&mut self) -> bool {
        if let Err(err) = self.reload_if_changed() {
            tracing::warn!(error = %err, path = %self.path.display(), "failed to reload config while checking is_active; using cached state");
        }
        self.cached.is_active()
    }

    /// Re-read the config file if its mtime changed. Returns `true` if the
    /// cache was refreshed.
    pub fn reload_if_changed(&mut self) -> Result<bool> {
        let mtime = file_mtime(&self.path);
        if mtime == self.last_mtime {
            return Ok(false);
        }
        self.cached = AppConfig::load_from(&self.path)?;
        self.last_mtime = mtime;
        Ok(true)
    }

    /// Unconditionally re-read the config file (used by `reload_pipelines`).
    pub fn force_reload(&mut self) -> Result<()> {
        self.cached = AppConfig::load_from(&self.path)?;
        self.last_mtime = file_mtime(&self.path);
        Ok(())
    }

    /// Persist a categorical infrastructure failure demotion to `dormant`
    /// This demotion must persist to disk. No-op if already
    /// dormant.
    pub fn demote_to_dormant(&mut self) -> Result<()> {
        if self.cached.state == PluginState::Dormant {
            return Ok(());
        }
        self.cached.state = PluginState::Dormant;
        self.cached.save_to(&self.path)?;
        self.last_mtime = file_mtime(&self.path);
        tracing::warn!(path = %self.path.display(), "state demoted to dormant after categorical infrastructure failure");
        Ok(())
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_dormant_and_inactive() {
        let config = AppConfig::default();
        assert_eq!(config.state, PluginState::Dormant);
        assert!(!config.is_active());
    }

    #[test]
    fn is_active_requires_all_three_surfaces() {
        let mut config = AppConfig::default();
        config.state = PluginState::Active;
        config.vault.endpoint = "vault.internal:443".to_string();
        config.vault.token = "tok".to_string();
        config.envector.endpoint = "https://env.internal".to_string();
        config.envector.api_key = "key".to_string();
        assert!(!config.is_active(), "still missing an LLM key");

        config.llm.anthropic_api_key = "sk-ant".to_string();
        assert!(config.is_active());
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.state, PluginState::Dormant);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.state = PluginState::Active;
        config.scribe.similarity_threshold = 0.4;
        config.save_to(&path).unwrap();

        let reloaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(reloaded.state, PluginState::Active);
        assert_eq!(reloaded.scribe.similarity_threshold, 0.4);
    }

    #[cfg(unix)]
    #[test]
    fn save_sets_user_only_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        AppConfig::default().save_to(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn resolve_auto_prefers_anthropic_then_openai_then_google() {
        let mut llm = LlmConfig::default();
        llm.provider = "auto".to_string();
        assert_eq!(llm.resolve_primary(), None);

        llm.google_api_key = "g".to_string();
        assert_eq!(llm.resolve_primary(), Some(LlmProviderKind::Google));

        llm.openai_api_key = "o".to_string();
        assert_eq!(llm.resolve_primary(), Some(LlmProviderKind::Openai));

        llm.anthropic_api_key = "a".to_string();
        assert_eq!(llm.resolve_primary(), Some(LlmProviderKind::Anthropic));
    }

    #[test]
    fn config_store_reloads_only_on_mtime_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        AppConfig::default().save_to(&path).unwrap();

        let mut store = ConfigStore::open(&path).unwrap();
        assert!(!store.reload_if_changed().unwrap());

        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut updated = AppConfig::default();
        updated.state = PluginState::Active;
        updated.save_to(&path).unwrap();

        assert!(store.reload_if_changed().unwrap());
        assert_eq!(store.current().state, PluginState::Active);
    }
}
