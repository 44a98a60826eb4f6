//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PANE__*` 覆盖（双下划线表示嵌套，如 `PANE__AGENT__MAX_STEPS=30`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub surface: SurfaceSection,
    pub agent: AgentSection,
    pub orchestrator: OrchestratorSection,
    /// [apps] 段：额外的「应用名 = 包名」映射，补充内置应用表
    pub apps: HashMap<String, String>,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 系统提示词文件，未设置时使用内置提示词
    pub system_prompt_path: Option<PathBuf>,
}

/// [llm] 段：UI 控制器模型（需支持识图）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：autoglm / openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 单次推理请求超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "autoglm".to_string(),
            model: "autoglm-phone".to_string(),
            base_url: None,
            request_timeout_secs: 120,
        }
    }
}

/// [surface] 段：特权服务连接与虚拟屏默认几何
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SurfaceSection {
    /// 服务的 Unix socket 路径；未设置时使用进程内模拟服务
    pub socket_path: Option<PathBuf>,
    /// 通道死亡时用于重启服务的命令（首词为程序，其余为参数）
    pub restart_command: Vec<String>,
    /// 重启后等待服务就绪的固定延迟（毫秒）
    pub restart_delay_ms: u64,
    pub default_width: u32,
    pub default_height: u32,
    pub default_dpi: u32,
    pub bitrate_kbps: u32,
    /// 截图超时（毫秒）
    pub screenshot_timeout_ms: u64,
    /// 启动应用时是否开启虚拟屏焦点修正
    pub virtual_display_fix: bool,
}

impl Default for SurfaceSection {
    fn default() -> Self {
        Self {
            socket_path: None,
            restart_command: Vec::new(),
            restart_delay_ms: 200,
            default_width: 1080,
            default_height: 2400,
            default_dpi: 440,
            bitrate_kbps: 3000,
            screenshot_timeout_ms: 3000,
            virtual_display_fix: false,
        }
    }
}

/// [agent] 段：单个循环的预算与节奏
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_steps: usize,
    /// 提示词中保留的最近轮数（只截掉最旧的）
    pub history_window: usize,
    pub post_launch_delay_ms: u64,
    pub post_action_delay_ms: u64,
    pub swipe_duration_ms: u64,
    pub long_press_ms: u64,
    pub clear_settle_ms: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_steps: 20,
            history_window: 8,
            post_launch_delay_ms: 1000,
            post_action_delay_ms: 500,
            swipe_duration_ms: 300,
            long_press_ms: 800,
            clear_settle_ms: 300,
        }
    }
}

/// [orchestrator] 段：批量并发与会话回收
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_batch: usize,
    /// 同时运行的 AgentRuntime 上限
    pub max_concurrent_runs: usize,
    /// 任务结束后是否销毁其虚拟屏（默认保留，便于复用会话）
    pub cleanup_on_finish: bool,
    /// 空闲会话回收阈值（秒），0 表示不回收
    pub idle_ttl_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_batch: 4,
            max_concurrent_runs: 4,
            cleanup_on_finish: false,
            idle_ttl_secs: 1800,
            reap_interval_secs: 60,
        }
    }
}

/// 从 config 目录加载配置，环境变量 PANE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PANE__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("PANE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_steps, 20);
        assert_eq!(cfg.orchestrator.max_batch, 4);
        assert!(!cfg.orchestrator.cleanup_on_finish);
        assert_eq!(cfg.surface.screenshot_timeout_ms, 3000);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[agent]\nmax_steps = 7\n\n[surface]\ndefault_width = 720\n\n[apps]\n\"Notes\" = \"com.example.notes\""
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.agent.max_steps, 7);
        assert_eq!(cfg.agent.history_window, 8);
        assert_eq!(cfg.surface.default_width, 720);
        assert_eq!(cfg.apps.get("Notes").map(String::as_str), Some("com.example.notes"));
    }
}
