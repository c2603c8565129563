//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RIDECAST__*` 覆盖
//! （双下划线表示嵌套，如 `RIDECAST__LINK__RECONNECT_DELAY_SECS=10`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::RelayError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub link: LinkSection,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub adapter: AdapterSection,
}

/// [app] 段：HTTP 监听端口、操作员白名单、默认群发间隔
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// 允许使用机器人的操作员外部 ID；为空时放行所有人
    #[serde(default)]
    pub allowed_operators: Vec<String>,
    /// 新操作员的默认群发间隔（毫秒）
    #[serde(default = "default_send_rate_ms")]
    pub default_send_rate_ms: u64,
}

fn default_port() -> u16 {
    3000
}

fn default_send_rate_ms() -> u64 {
    5000
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            allowed_operators: Vec::new(),
            default_send_rate_ms: default_send_rate_ms(),
        }
    }
}

/// [database] 段：SQLite 文件路径
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./ridecast.sqlite")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// [link] 段：下游连接监管参数
#[derive(Debug, Clone, Deserialize)]
pub struct LinkSection {
    /// 意外断线后的固定重连延迟（秒）
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// 自动重连次数上限，超过后需操作员显式重连
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_reconnect_delay_secs() -> u64 {
    30
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

/// [sessions] 段：会话表的 LRU 驱逐策略
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    /// 同时保留的会话数上限
    #[serde(default = "default_session_capacity")]
    pub capacity: usize,
    /// 空闲超时（秒），超时会话在清理时被移除
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_session_capacity() -> usize {
    1000
}

fn default_idle_timeout_secs() -> u64 {
    3600
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            capacity: default_session_capacity(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

/// [adapter] 段：出站回复 Webhook
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AdapterSection {
    /// 回复推送地址；未设置时回复仅写日志
    pub reply_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            database: DatabaseSection::default(),
            link: LinkSection::default(),
            sessions: SessionsSection::default(),
            adapter: AdapterSection::default(),
        }
    }
}

impl AppConfig {
    /// 加载后校验；不合法的配置直接拒绝启动
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.app.default_send_rate_ms < 1000 {
            return Err(RelayError::ConfigError(
                "default_send_rate_ms must be at least 1000".into(),
            ));
        }
        if self.sessions.capacity == 0 {
            return Err(RelayError::ConfigError(
                "sessions.capacity must be at least 1".into(),
            ));
        }
        if self.link.max_reconnect_attempts == 0 {
            return Err(RelayError::ConfigError(
                "link.max_reconnect_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 RIDECAST__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RIDECAST__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RIDECAST")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.app.default_send_rate_ms, 5000);
        assert_eq!(cfg.link.max_reconnect_attempts, 5);
        assert_eq!(cfg.link.reconnect_delay_secs, 30);
    }

    #[test]
    fn rejects_sub_floor_rate() {
        let mut cfg = AppConfig::default();
        cfg.app.default_send_rate_ms = 500;
        assert!(cfg.validate().is_err());
    }
}
