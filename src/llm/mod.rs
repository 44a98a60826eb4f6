//! LLM 层：客户端抽象与实现（OpenAI 兼容 / AutoGLM / Mock）

pub mod autoglm;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use autoglm::{create_autoglm_client, AUTOGLM_BASE_URL, AUTOGLM_PHONE};
pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::LlmClient;

use crate::config::AppConfig;

/// 按配置与环境变量选择后端；没有任何 Key 时退回 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let has_autoglm_key = std::env::var("AUTOGLM_API_KEY").is_ok();
    let has_openai_key = std::env::var("OPENAI_API_KEY").is_ok();

    match provider.as_str() {
        "mock" => {
            tracing::info!("Using Mock LLM (configured)");
            Arc::new(MockLlmClient)
        }
        "openai" if has_openai_key => {
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                std::env::var("OPENAI_API_KEY").ok().as_deref(),
            ))
        }
        "autoglm" if has_autoglm_key || has_openai_key => {
            tracing::info!("Using AutoGLM LLM ({})", cfg.llm.model);
            Arc::new(create_autoglm_client(
                cfg.llm.base_url.as_deref(),
                Some(&cfg.llm.model),
            ))
        }
        _ => {
            tracing::warn!("No API key set or provider unknown, using Mock LLM");
            Arc::new(MockLlmClient)
        }
    }
}
