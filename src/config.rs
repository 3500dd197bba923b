//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `REALITYCHECK__*` 覆盖
//! （双下划线表示嵌套，如 `REALITYCHECK__LLM__PROVIDER=openai`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::session::EngineSettings;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionSection,
    pub llm: LlmSection,
    pub store: StoreSection,
    pub server: ServerSection,
}

/// [session] 段：滚动窗口、观测容量、阶段超时、不活跃超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub rolling_window_size: usize,
    /// 每个会话保留的观测上限，超出淘汰最旧
    pub max_observations: usize,
    /// 单次阶段调用超时（秒）
    pub stage_timeout_secs: u64,
    pub inactivity_timeout_secs: u64,
    /// 后台清扫间隔（秒）
    pub sweep_interval_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            rolling_window_size: 5,
            max_observations: 200,
            stage_timeout_secs: 30,
            inactivity_timeout_secs: 1800,
            sweep_interval_secs: 60,
        }
    }
}

impl SessionSection {
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            rolling_window_size: self.rolling_window_size.max(1),
            max_observations: self.max_observations.max(1),
            stage_timeout: Duration::from_secs(self.stage_timeout_secs.max(1)),
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// [llm] 段：后端选择；三个阶段可分别指定模型
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / mock；openai 但未设置 OPENAI_API_KEY 时回退 mock
    pub provider: String,
    pub base_url: Option<String>,
    pub perception_model: String,
    pub planner_model: String,
    pub verifier_model: String,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            base_url: None,
            perception_model: "gpt-4o-mini".to_string(),
            planner_model: "gpt-4o".to_string(),
            verifier_model: "gpt-4o".to_string(),
        }
    }
}

/// [store] 段：未设置 sqlite_path 时使用内存存储
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StoreSection {
    pub sqlite_path: Option<PathBuf>,
}

/// [server] 段：HTTP 监听地址
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 REALITYCHECK__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量
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
        config::Environment::with_prefix("REALITYCHECK")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
