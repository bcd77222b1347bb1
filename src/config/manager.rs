//! 配置管理器 - 负责处理不同环境下的配置覆盖
//!
//! 覆盖顺序：
//! 1. `config/environments/{FLARE_ENV}.toml`（深度合并）
//! 2. 单项环境变量（`FLARE_CHAT_BACKEND_URL`、`FLARE_CHAT_STORE_ROOT`）

use std::env;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use toml::Value;
use tracing::debug;

use super::{ChatSyncConfig, overlay_table, read_table};

/// 后端地址环境变量
pub const ENV_BACKEND_URL: &str = "FLARE_CHAT_BACKEND_URL";
/// 存储根路径环境变量
pub const ENV_STORE_ROOT: &str = "FLARE_CHAT_STORE_ROOT";

/// 配置管理器
pub struct ConfigManager;

impl ConfigManager {
    /// 获取当前环境名称
    ///
    /// 从环境变量 FLARE_ENV 获取当前环境名称，
    /// 如果未设置则默认为 "development"
    pub fn get_environment() -> String {
        env::var("FLARE_ENV").unwrap_or_else(|_| "development".to_string())
    }

    /// 根据当前环境加载 `config/environments/{environment}.toml`
    pub fn load_environment_config(base_config: &mut ChatSyncConfig) -> Result<()> {
        let env = Self::get_environment();
        Self::load_environment_config_from(base_config, Path::new("config"), &env)
    }

    /// 从指定配置目录加载环境配置并合并到基础配置中；文件不存在时不做任何修改
    pub fn load_environment_config_from(
        base_config: &mut ChatSyncConfig,
        config_dir: &Path,
        environment: &str,
    ) -> Result<()> {
        let env_config_path = config_dir
            .join("environments")
            .join(format!("{}.toml", environment));

        if !env_config_path.exists() {
            return Ok(());
        }

        let layer = read_table(&env_config_path)?;
        let mut merged = match Value::try_from(&*base_config)
            .context("unable to serialize base configuration")?
        {
            Value::Table(table) => table,
            _ => return Err(anyhow!("base configuration did not serialize to a table")),
        };
        overlay_table(&mut merged, layer);
        *base_config = Value::Table(merged).try_into().with_context(|| {
            format!(
                "invalid configuration after applying {}",
                env_config_path.display()
            )
        })?;

        debug!(environment = %environment, "Environment config applied");
        Ok(())
    }

    /// 应用进程环境变量覆盖
    pub fn apply_env_overrides(config: &mut ChatSyncConfig) {
        Self::apply_overrides_from(config, |key| env::var(key).ok());
    }

    /// 使用给定的查找函数应用覆盖；空值忽略
    pub fn apply_overrides_from<F>(config: &mut ChatSyncConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let value_of = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = value_of(ENV_BACKEND_URL) {
            debug!(key = ENV_BACKEND_URL, "Backend URL overridden from environment");
            config.backend.base_url = Some(url);
        }
        if let Some(root) = value_of(ENV_STORE_ROOT) {
            debug!(key = ENV_STORE_ROOT, "Store root overridden from environment");
            config.store.root = root;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    #[test]
    fn test_environment_file_overlays_config() {
        let dir = tempfile::tempdir().unwrap();
        let env_dir = dir.path().join("environments");
        fs::create_dir_all(&env_dir).unwrap();
        fs::write(
            env_dir.join("staging.toml"),
            "[backend]\nbase_url = \"https://staging.example.com\"\n",
        )
        .unwrap();

        let mut cfg = ChatSyncConfig::default();
        cfg.backend.timeout_ms = 1234;
        ConfigManager::load_environment_config_from(&mut cfg, dir.path(), "staging").unwrap();

        assert_eq!(
            cfg.backend.base_url.as_deref(),
            Some("https://staging.example.com")
        );
        assert_eq!(cfg.backend.timeout_ms, 1234);

        // 不存在的环境文件不修改配置
        ConfigManager::load_environment_config_from(&mut cfg, dir.path(), "production").unwrap();
        assert_eq!(cfg.backend.timeout_ms, 1234);
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_BACKEND_URL, "http://override:9000"),
            (ENV_STORE_ROOT, "  "),
        ]);
        let mut cfg = ChatSyncConfig::default();
        ConfigManager::apply_overrides_from(&mut cfg, |key| {
            vars.get(key).map(|value| value.to_string())
        });

        assert_eq!(cfg.backend.base_url.as_deref(), Some("http://override:9000"));
        assert_eq!(cfg.store.root, "chats");
    }
}
