//! AutoGLM 客户端（智谱开放平台，OpenAI 兼容格式）
//!
//! - Base URL: https://open.bigmodel.cn/api/paas/v4
//! - 模型: autoglm-phone（手机 UI 控制，输出 do(...) / finish(...) 动作语法）

use crate::llm::OpenAiClient;

pub const AUTOGLM_BASE_URL: &str = "https://open.bigmodel.cn/api/paas/v4";
pub const AUTOGLM_PHONE: &str = "autoglm-phone";

/// 创建 AutoGLM 客户端
///
/// - 优先使用环境变量 `AUTOGLM_API_KEY`，其次 `OPENAI_API_KEY`
/// - base_url 为 None 时使用官方端点；模型可通过 `AUTOGLM_MODEL` 覆盖
pub fn create_autoglm_client(base_url: Option<&str>, model: Option<&str>) -> OpenAiClient {
    let api_key = std::env::var("AUTOGLM_API_KEY")
        .ok()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .unwrap_or_else(|| "sk-placeholder".to_string());

    let model = model
        .map(String::from)
        .or_else(|| std::env::var("AUTOGLM_MODEL").ok())
        .unwrap_or_else(|| AUTOGLM_PHONE.to_string());

    OpenAiClient::new(
        Some(base_url.unwrap_or(AUTOGLM_BASE_URL)),
        &model,
        Some(api_key.as_str()),
    )
}
