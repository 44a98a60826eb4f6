//! Pane - 虚拟屏 UI 自动化编排器
//!
//! 入口：初始化日志、加载配置、构建编排器，读取一个 JSON 请求（命令行参数或 stdin），
//! 运行到结束后把结果 JSON 打印到 stdout。`--schema` 打印请求参数的 JSON Schema。

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pane::agent::{handle_request, request_schemas};
use pane::config::load_config;
use pane::core::shutdown::{cancel_on_shutdown, drain};
use pane::core::{ShutdownManager, ShutdownReason, TaskOrchestrator};

#[derive(Parser, Debug)]
#[command(author, version, about = "虚拟屏 UI 自动化编排器")]
struct Cli {
    /// 打印请求参数的 JSON Schema 后退出
    #[arg(long)]
    schema: bool,

    /// 配置文件路径（默认搜索 config/default.toml）
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON 请求；省略时从 stdin 读取
    request: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    pane::observability::init();

    if cli.schema {
        println!("{}", serde_json::to_string_pretty(&request_schemas())?);
        return Ok(());
    }

    let cfg = load_config(cli.config).context("Failed to load config")?;
    let request = match cli.request {
        Some(r) => r,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read request from stdin")?;
            buf
        }
    };

    let orchestrator = TaskOrchestrator::from_config(&cfg);
    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let watcher = cancel_on_shutdown(&shutdown, orchestrator.clone());
    let reaper = orchestrator.spawn_idle_reaper(shutdown.token());

    let response = handle_request(&orchestrator, &request).await;

    if !shutdown.is_shutdown() {
        shutdown.shutdown(ShutdownReason::Completed);
    }
    let _ = watcher.await;
    if let Some(reaper) = reaper {
        let _ = reaper.await;
    }
    drain(&orchestrator, Duration::from_secs(5)).await;

    println!("{}", response.to_json());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags_and_request() {
        let cli = Cli::try_parse_from(["pane", "--config", "pane.toml", "{\"intent\":\"x\"}"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("pane.toml")));
        assert_eq!(cli.request.as_deref(), Some("{\"intent\":\"x\"}"));
        assert!(!cli.schema);
        assert!(Cli::try_parse_from(["pane", "--schema"]).unwrap().schema);
    }

    #[test]
    fn test_cli_rejects_bad_usage() {
        assert!(Cli::try_parse_from(["pane", "--config"]).is_err());
        assert!(Cli::try_parse_from(["pane", "--verbose"]).is_err());
    }
}
