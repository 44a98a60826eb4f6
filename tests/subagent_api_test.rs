//! JSON 接口集成测试

mod common;

use std::time::Duration;

use common::{launch_then_finish, orchestrator};
use pane::agent::{handle_request, run_subagent_parallel, ParallelSubagentRequest};
use pane::surface::MockSurfaceService;

#[tokio::test]
async fn test_duplicate_target_app_rejects_whole_batch() {
    let mock = MockSurfaceService::new();
    let llm = launch_then_finish(Duration::ZERO);
    let orch = orchestrator(&mock, llm.clone());

    let response = handle_request(
        &orch,
        r#"{"intent_1": "search hotel", "target_app_1": "AppA",
            "intent_2": "search flight", "target_app_2": "AppA"}"#,
    )
    .await;
    assert!(!response.success);
    assert!(response.message.contains("target_app"));
    assert!(response.message.contains("1, 2"));
    assert_eq!(llm.calls(), 0);
    assert!(mock.calls().is_empty());
    assert!(orch.manager().registry().session_ids().await.is_empty());
}

#[tokio::test]
async fn test_missing_target_app_names_every_slot() {
    let mock = MockSurfaceService::new();
    let orch = orchestrator(&mock, launch_then_finish(Duration::ZERO));

    let response = run_subagent_parallel(
        &orch,
        ParallelSubagentRequest {
            intent_1: Some("a".into()),
            intent_2: Some("b".into()),
            target_app_2: Some("设置".into()),
            intent_3: Some("c".into()),
            ..Default::default()
        },
    )
    .await;
    assert!(!response.success);
    assert!(response.message.contains("intent_1"));
    assert!(response.message.contains("intent_3"));
    assert!(response.message.contains("target_app_3"));
}

#[tokio::test]
async fn test_single_request_reports_run() {
    let mock = MockSurfaceService::new();
    let orch = orchestrator(&mock, launch_then_finish(Duration::ZERO));

    let response = handle_request(&orch, r#"{"intent": "打开 设置", "max_steps": 5}"#).await;
    assert!(response.success, "{}", response.message);
    assert_eq!(response.message, "打开 设置 完成");
    let data = &response.data;
    assert_eq!(data["steps"], 2);
    assert_eq!(data["max_steps"], 5);
    assert_eq!(data["finished"], true);
    assert!(data["surface_id"].is_i64());
    assert_eq!(data["session_id"].as_str().map(str::len), Some(8));
    assert_eq!(data["log"].as_array().map(Vec::len), Some(2));

    // 用返回的 session_id 再次提交落在同一个虚拟屏上
    let again = handle_request(
        &orch,
        &format!(r#"{{"intent": "打开 设置", "session_id": "{}"}}"#, data["session_id"].as_str().unwrap()),
    )
    .await;
    assert_eq!(again.data["surface_id"], data["surface_id"]);
}

#[tokio::test]
async fn test_parallel_request_aggregates() {
    let mock = MockSurfaceService::new();
    let orch = orchestrator(&mock, launch_then_finish(Duration::ZERO));

    let response = handle_request(
        &orch,
        r#"{"intent_1": "打开 微信", "target_app_1": "微信",
            "intent_3": "打开 设置 慢慢看", "target_app_3": "设置", "max_steps_3": 2}"#,
    )
    .await;
    assert!(!response.success);
    assert_eq!(response.message, "成功 1 个 / 共 2 个");
    let results = response.data["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["index"], 1);
    assert_eq!(results[0]["success"], true);
    assert!(results[0]["result"].is_string());
    assert_eq!(results[1]["index"], 3);
    assert_eq!(results[1]["success"], false);
    assert!(results[1]["error"].as_str().unwrap().starts_with("Reached max steps (2)"));
}

#[tokio::test]
async fn test_invalid_json_is_reported() {
    let mock = MockSurfaceService::new();
    let orch = orchestrator(&mock, launch_then_finish(Duration::ZERO));
    let response = handle_request(&orch, "not json").await;
    assert!(!response.success);
    assert!(response.message.contains("Invalid request JSON"));
}

#[tokio::test]
async fn test_blank_intent_is_rejected() {
    let mock = MockSurfaceService::new();
    let orch = orchestrator(&mock, launch_then_finish(Duration::ZERO));
    let response = handle_request(&orch, r#"{"intent": "   "}"#).await;
    assert!(!response.success);
    assert!(response.message.contains("intent_1 is empty"));
    assert!(mock.calls().is_empty());
}
