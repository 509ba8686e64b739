//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `FORAGER__*` 覆盖（双下划线表示嵌套，如 `FORAGER__RETRY__BASE_DELAY_MS=250`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 情景记忆容量（超出后最早的记录被淘汰）
    pub max_episodes: usize,
    /// 每个 episode 的步数预算
    pub max_steps: usize,
    /// 单次适配器调用的超时（毫秒）
    pub timeout_ms: u64,
    /// 同一动作的尝试次数上限
    pub retry_attempts: u32,
    pub enable_memory: bool,
    pub enable_planning: bool,
    pub enable_critique: bool,
    /// 情景日志与规划指标的落盘目录；未设置时只保存在内存
    pub persistence_dir: Option<PathBuf>,
    pub planning: PlanningSection,
    pub critique: CritiqueSection,
    pub retry: RetrySection,
    pub controller: ControllerSection,
}

/// [planning] 段：停滞检测与重新规划预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlanningSection {
    /// 连续多少步指纹相同视为停滞
    pub stall_threshold: usize,
    /// 单个子目标的尝试上限，超过视为停滞
    pub max_subgoal_attempts: u32,
    pub max_replans: u32,
}

impl Default for PlanningSection {
    fn default() -> Self {
        Self {
            stall_threshold: 3,
            max_subgoal_attempts: 6,
            max_replans: 3,
        }
    }
}

/// [critique] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CritiqueSection {
    /// 高于该分数才算动作有效；否则按软失败处理
    pub effectiveness_threshold: f64,
}

impl Default for CritiqueSection {
    fn default() -> Self {
        Self {
            effectiveness_threshold: 0.5,
        }
    }
}

/// [retry] 段：指数退避参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 8000,
        }
    }
}

/// [controller] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    /// 每步从情景记忆召回的条数
    pub recall_k: usize,
    /// 未指定时使用的领域
    pub domain: String,
    /// 整个 episode 的墙钟超时（毫秒），0 表示不限
    pub episode_timeout_ms: u64,
    /// 并行 episode 数上限（EpisodeRunner）
    pub max_concurrent_episodes: usize,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            recall_k: 5,
            domain: "general".to_string(),
            episode_timeout_ms: 0,
            max_concurrent_episodes: 4,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_episodes: 1000,
            max_steps: 25,
            timeout_ms: 15000,
            retry_attempts: 3,
            enable_memory: true,
            enable_planning: true,
            enable_critique: true,
            persistence_dir: None,
            planning: PlanningSection::default(),
            critique: CritiqueSection::default(),
            retry: RetrySection::default(),
            controller: ControllerSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 FORAGER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 FORAGER__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("FORAGER")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（调用方可在 episode 之间调用并决定是否用新配置重建 Controller）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let c = AppConfig::default();
        assert_eq!(c.retry_attempts, 3);
        assert_eq!(c.planning.stall_threshold, 3);
        assert!(c.enable_memory && c.enable_planning && c.enable_critique);
        assert!(c.persistence_dir.is_none());
    }

    #[test]
    fn test_load_explicit_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forager.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "max_steps = 7\nenable_critique = false\n\n[retry]\nbase_delay_ms = 20\n\n[controller]\ndomain = \"catalog\""
        )
        .unwrap();
        let c = load_config(Some(path)).unwrap();
        assert_eq!(c.max_steps, 7);
        assert!(!c.enable_critique);
        assert_eq!(c.retry.base_delay_ms, 20);
        assert_eq!(c.retry.max_delay_ms, 8000);
        assert_eq!(c.controller.domain, "catalog");
        assert_eq!(c.controller.recall_k, 5);
    }
}
