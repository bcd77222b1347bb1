//! 聊天同步配置模块
//!
//! 该模块提供了配置加载与管理功能，包括：
//! - 配置文件（单文件或目录）加载和解析
//! - 环境特定配置与环境变量覆盖
//! - 日志、存储、后端、订阅配置定义

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use toml::{Table, Value};
use tracing::warn;

mod manager;
pub use manager::ConfigManager;

use crate::store::DEFAULT_CHATS_ROOT;

/// 全局应用配置实例，使用 OnceLock 确保只初始化一次
static APP_CONFIG: OnceLock<ChatSyncConfig> = OnceLock::new();

const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CHANNEL_CAPACITY_WARN: usize = 1024;

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别（RUST_LOG 未设置时生效）
    pub level: String,
    pub with_target: bool,
    pub with_thread_ids: bool,
    pub with_file: bool,
    pub with_line_number: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
        }
    }
}

/// 实时存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// 聊天根路径，消息位于 `<root>/<chatId>/messages/<messageId>`
    pub root: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: DEFAULT_CHATS_ROOT.to_string(),
        }
    }
}

/// REST 后端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// 后端基础地址，例如 `https://api.example.com/v1`
    pub base_url: Option<String>,
    /// 请求超时（毫秒）
    pub timeout_ms: u64,
    /// Bearer 令牌
    pub auth_token: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: DEFAULT_BACKEND_TIMEOUT_MS,
            auth_token: None,
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// 订阅配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// 快照在途期间缓冲事件数超过该值时输出告警
    pub channel_capacity_warn: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            channel_capacity_warn: DEFAULT_CHANNEL_CAPACITY_WARN,
        }
    }
}

/// 聊天同步应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSyncConfig {
    pub logging: LoggingConfig,
    pub store: StoreConfig,
    pub backend: BackendConfig,
    pub subscription: SubscriptionConfig,
}

impl ChatSyncConfig {
    /// 确保配置有默认值
    fn ensure_defaults(&mut self) {
        let root = self.store.root.trim_matches('/');
        if root.is_empty() {
            self.store.root = DEFAULT_CHATS_ROOT.to_string();
        } else if root.len() != self.store.root.len() {
            self.store.root = root.to_string();
        }
        if self.backend.timeout_ms == 0 {
            self.backend.timeout_ms = DEFAULT_BACKEND_TIMEOUT_MS;
        }
        if self.subscription.channel_capacity_warn == 0 {
            self.subscription.channel_capacity_warn = DEFAULT_CHANNEL_CAPACITY_WARN;
        }
        if self.logging.level.trim().is_empty() {
            self.logging.level = LoggingConfig::default().level;
        }
    }
}

/// 加载配置（只在首次调用时生效）
///
/// 未指定路径时依次尝试 `config/`、`config.toml`，均失败则使用默认配置；
/// 之后叠加环境配置与环境变量覆盖。
pub fn load_config(path: Option<&str>) -> &'static ChatSyncConfig {
    APP_CONFIG.get_or_init(|| resolve_config(path))
}

/// 获取应用配置
pub fn app_config() -> &'static ChatSyncConfig {
    APP_CONFIG.get().expect("configuration not initialised")
}

/// 解析配置但不写入全局实例
pub fn resolve_config(path: Option<&str>) -> ChatSyncConfig {
    let candidates: Vec<PathBuf> = match path {
        Some(p) => vec![PathBuf::from(p)],
        None => vec![PathBuf::from("config"), PathBuf::from("config.toml")],
    };

    let mut cfg = load_with_fallback(&candidates);
    if let Err(e) = ConfigManager::load_environment_config(&mut cfg) {
        warn!("failed to load environment config: {}", e);
    }
    ConfigManager::apply_env_overrides(&mut cfg);
    cfg.ensure_defaults();
    cfg
}

/// 使用备选方案加载配置
fn load_with_fallback(candidates: &[PathBuf]) -> ChatSyncConfig {
    for path in candidates {
        match load_config_from(path) {
            Ok(cfg) => return cfg,
            Err(err) => {
                warn!("failed to load config from {}: {err}", path.display());
            }
        }
    }

    warn!("no configuration source succeeded, falling back to defaults");
    ChatSyncConfig::default()
}

/// 从文件或目录加载配置
pub fn load_config_from(path: &Path) -> Result<ChatSyncConfig> {
    if !path.exists() {
        return Err(anyhow!(
            "configuration path {} does not exist",
            path.display()
        ));
    }

    let metadata = path
        .metadata()
        .with_context(|| format!("unable to read metadata for {}", path.display()))?;

    let mut cfg = if metadata.is_dir() {
        load_config_from_directory(path)?
    } else {
        load_config_from_file(path)?
    };
    cfg.ensure_defaults();
    Ok(cfg)
}

/// 从文件加载配置
fn load_config_from_file(path: &Path) -> Result<ChatSyncConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read config file: {}", path.display()))?;
    let cfg: ChatSyncConfig = toml::from_str(&content)
        .with_context(|| format!("invalid config format: {}", path.display()))?;
    Ok(cfg)
}

/// 从目录加载配置：`base.toml` + `shared/` + `overrides/`
///
/// 后加载的层覆盖先加载的层，子目录内按文件名排序
fn load_config_from_directory(path: &Path) -> Result<ChatSyncConfig> {
    let base_file = path.join("base.toml");
    if !base_file.is_file() {
        return Err(anyhow!(
            "missing base configuration: {}",
            base_file.display()
        ));
    }

    let mut layers = vec![base_file];
    layers.extend(toml_fragments(&path.join("shared"))?);
    layers.extend(toml_fragments(&path.join("overrides"))?);

    let mut merged = Table::new();
    for layer in &layers {
        overlay_table(&mut merged, read_table(layer)?);
    }

    Value::Table(merged)
        .try_into()
        .with_context(|| format!("invalid configuration after merging {}", path.display()))
}

/// 列出目录中的 `*.toml` 片段；目录不存在时为空
fn toml_fragments(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut fragments = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("unable to list config directory {}", dir.display()))?
    {
        let path = entry
            .with_context(|| format!("unable to read entry in {}", dir.display()))?
            .path();
        let is_toml = path
            .extension()
            .and_then(OsStr::to_str)
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml && path.is_file() {
            fragments.push(path);
        }
    }
    fragments.sort();
    Ok(fragments)
}

pub(crate) fn read_table(path: &Path) -> Result<Table> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read config layer {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("config layer {} is not a valid TOML table", path.display()))
}

/// 把 `layer` 叠加到 `target` 上：两侧同名键都是表时递归合并，否则整体替换
pub(crate) fn overlay_table(target: &mut Table, layer: Table) {
    for (key, value) in layer {
        if let Value::Table(nested) = value {
            if let Some(Value::Table(existing)) = target.get_mut(&key) {
                overlay_table(existing, nested);
                continue;
            }
            target.insert(key, Value::Table(nested));
        } else {
            target.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_defaults() {
        let cfg = ChatSyncConfig::default();
        assert_eq!(cfg.store.root, "chats");
        assert_eq!(cfg.backend.timeout(), Duration::from_secs(10));
        assert_eq!(cfg.subscription.channel_capacity_warn, 1024);
        assert!(cfg.backend.base_url.is_none());
    }

    #[test]
    fn test_load_single_file_with_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.toml");
        write(
            &file,
            r#"
[backend]
base_url = "https://chat.example.com/api"

[store]
root = "/tenants/t1/chats/"
"#,
        );

        let cfg = load_config_from(&file).unwrap();
        assert_eq!(
            cfg.backend.base_url.as_deref(),
            Some("https://chat.example.com/api")
        );
        assert_eq!(cfg.backend.timeout_ms, 10_000);
        assert_eq!(cfg.store.root, "tenants/t1/chats");
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_load_directory_merges_fragments_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("base.toml"),
            r#"
[logging]
level = "debug"

[backend]
base_url = "http://localhost:8080"
timeout_ms = 5000
"#,
        );
        write(
            &dir.path().join("shared/10-backend.toml"),
            "[backend]\ntimeout_ms = 2000\n",
        );
        write(
            &dir.path().join("shared/20-backend.toml"),
            "[backend]\ntimeout_ms = 3000\n",
        );
        write(
            &dir.path().join("overrides/local.toml"),
            "[subscription]\nchannel_capacity_warn = 16\n",
        );

        let cfg = load_config_from(dir.path()).unwrap();
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.backend.base_url.as_deref(), Some("http://localhost:8080"));
        assert_eq!(cfg.backend.timeout_ms, 3000);
        assert_eq!(cfg.subscription.channel_capacity_warn, 16);
    }

    #[test]
    fn test_directory_requires_base() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config_from(dir.path()).is_err());
    }

    #[test]
    fn test_fallback_to_defaults() {
        let cfg = load_with_fallback(&[PathBuf::from("/nonexistent/chat-sync.toml")]);
        assert_eq!(cfg.store.root, "chats");
    }

    #[test]
    fn test_overlay_replaces_scalars_and_merges_tables() {
        let mut base: Table = toml::from_str("name = \"a\"\n[a]\nx = 1\ny = 2\n").unwrap();
        let layer: Table = toml::from_str("name = { nested = true }\n[a]\ny = 3\nz = 4\n").unwrap();
        overlay_table(&mut base, layer);

        let table = base["a"].as_table().unwrap();
        assert_eq!(table["x"].as_integer(), Some(1));
        assert_eq!(table["y"].as_integer(), Some(3));
        assert_eq!(table["z"].as_integer(), Some(4));
        // 标量被表整体替换
        assert_eq!(base["name"]["nested"].as_bool(), Some(true));
    }

    #[test]
    fn test_directory_ignores_non_toml_fragments() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("base.toml"), "[store]\nroot = \"chats\"\n");
        write(&dir.path().join("shared/notes.txt"), "[store]\nroot = \"ignored\"\n");
        write(&dir.path().join("shared/store.TOML"), "[store]\nroot = \"tenants/t2/chats\"\n");

        let cfg = load_config_from(dir.path()).unwrap();
        assert_eq!(cfg.store.root, "tenants/t2/chats");
    }
}
