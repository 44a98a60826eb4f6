//! 编排器集成测试：互斥、会话延续、取消隔离、步数预算、通道恢复、日志完整性

mod common;

use std::time::Duration;

use common::{launch_then_finish, orchestrator, wait_until};
use pane::core::{OrchestratorError, RunState, TaskStatus};
use pane::llm::ScriptedLlmClient;
use pane::surface::MockSurfaceService;
use pane::{SubmitOptions, Task};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_running_app_blocks_later_batch() {
    let mock = MockSurfaceService::new();
    let orch = orchestrator(&mock, launch_then_finish(Duration::from_millis(5)));

    let first = orch
        .submit(
            vec![Task::new("打开 微信 慢慢等").with_target_app("微信").with_max_steps(500)],
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    let busy_session = first.session_ids()[0].clone();

    let err = orch
        .submit(
            vec![Task::new("打开 微信 发消息").with_target_app(" 微信 ")],
            SubmitOptions::default(),
        )
        .await
        .err();
    match err {
        Some(OrchestratorError::TargetAppBusy { index, session_id, .. }) => {
            assert_eq!(index, 1);
            assert_eq!(session_id, busy_session);
        }
        other => panic!("expected TargetAppBusy, got {other:?}"),
    }

    // 其他应用不受影响
    let other = orch
        .submit(vec![Task::new("打开 设置").with_target_app("设置")], SubmitOptions::default())
        .await
        .unwrap()
        .join()
        .await;
    assert_eq!(other.success_count, 1);

    assert!(orch.cancel(&busy_session).await);
    let cancelled = first.join().await;
    assert_eq!(cancelled.results[0].status, TaskStatus::Canceled);

    // 运行结束后该应用重新可用
    let again = orch
        .submit(vec![Task::new("打开 微信").with_target_app("微信")], SubmitOptions::default())
        .await
        .unwrap()
        .join()
        .await;
    assert_eq!(again.success_count, 1);
}

#[tokio::test]
async fn test_resubmit_with_session_reuses_surface() {
    let mock = MockSurfaceService::new();
    let orch = orchestrator(&mock, launch_then_finish(Duration::ZERO));

    let first = orch.run_single(Task::new("打开 设置"), SubmitOptions::default()).await.unwrap();
    assert!(first.success);
    let surface = first.surface_id.expect("surface bound");

    let second = orch
        .run_single(
            Task::new("打开 设置").with_session(first.session_id.clone()),
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(second.session_id, first.session_id);
    assert_eq!(second.surface_id, Some(surface));
    assert_eq!(mock.calls_named("ensure_display"), 1);
    assert_eq!(mock.calls_named("destroy_display"), 0);
    assert_eq!(mock.live_displays(), vec![surface]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_one_of_three_keeps_others_and_surface() {
    let mock = MockSurfaceService::new();
    let orch = orchestrator(&mock, launch_then_finish(Duration::from_millis(5)));

    let handle = orch
        .submit(
            vec![
                Task::new("打开 微信").with_target_app("微信"),
                Task::new("打开 淘宝 慢慢逛").with_target_app("淘宝").with_max_steps(500),
                Task::new("打开 设置").with_target_app("设置"),
            ],
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    let target = handle.session_ids()[1].clone();

    let registry = orch.manager().registry().clone();
    let ready = wait_until(Duration::from_secs(5), || {
        let registry = registry.clone();
        let target = target.clone();
        async move { registry.surface_id(&target).await.is_some() }
    })
    .await;
    assert!(ready, "slow task never launched its app");

    assert!(orch.cancel(&target).await);
    let batch = handle.join().await;

    let statuses: Vec<TaskStatus> = batch.results.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![TaskStatus::Success, TaskStatus::Canceled, TaskStatus::Success]);
    assert_eq!(batch.success_count, 2);
    assert_eq!(batch.summary(), "成功 2 个 / 共 3 个");

    let cancelled = &batch.results[1];
    assert_eq!(cancelled.state, RunState::Cancelled);
    assert_eq!(cancelled.message, "Cancelled");
    let surface = cancelled.surface_id.expect("surface kept");
    assert!(mock.display(surface).is_some());
    assert_eq!(mock.live_displays().len(), 3);
    assert_eq!(mock.calls_named("destroy_display"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_all_reports_canceled() {
    let mock = MockSurfaceService::new();
    let orch = orchestrator(&mock, launch_then_finish(Duration::from_millis(5)));

    let handle = orch
        .submit(
            vec![
                Task::new("打开 微信 慢慢等").with_target_app("微信").with_max_steps(500),
                Task::new("打开 淘宝 慢慢逛").with_target_app("淘宝").with_max_steps(500),
            ],
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(orch.cancel_all().await, 2);
    let batch = handle.join().await;
    assert!(batch.results.iter().all(|r| r.status == TaskStatus::Canceled));
    assert_eq!(batch.success_count, 0);
    assert!(orch.supervisor().running_sessions().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_and_cleanup_destroys_after_run_ends() {
    let mock = MockSurfaceService::new();
    let orch = orchestrator(&mock, launch_then_finish(Duration::from_millis(5)));

    let handle = orch
        .submit(
            vec![Task::new("打开 微信 慢慢等").with_max_steps(500)],
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    let session = handle.session_ids()[0].clone();
    let registry = orch.manager().registry().clone();
    let launched = wait_until(Duration::from_secs(5), || {
        let registry = registry.clone();
        let session = session.clone();
        async move { registry.surface_id(&session).await.is_some() }
    })
    .await;
    assert!(launched);

    assert_eq!(orch.cancel_and_cleanup(&session).await, Ok(true));
    let batch = handle.join().await;
    assert_eq!(batch.results[0].status, TaskStatus::Canceled);
    assert!(mock.live_displays().is_empty());
    assert_eq!(mock.calls_named("destroy_display"), 1);
}

#[tokio::test]
async fn test_budget_exhausts_after_exactly_n_steps() {
    let mock = MockSurfaceService::new();
    let llm = launch_then_finish(Duration::ZERO);
    let orch = orchestrator(&mock, llm.clone());

    let report = orch
        .run_single(Task::new("打开 设置 慢慢看").with_max_steps(3), SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Exhausted);
    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.steps(), 3);
    assert_eq!(llm.calls(), 3);
    assert!(report.message.starts_with("Reached max steps (3)"));
}

#[tokio::test]
async fn test_single_channel_death_is_retried_once() {
    let mock = MockSurfaceService::new();
    let orch = orchestrator(&mock, launch_then_finish(Duration::ZERO));
    mock.fail_next_calls(1);

    let report = orch.run_single(Task::new("打开 设置"), SubmitOptions::default()).await.unwrap();
    assert!(report.success);
    assert_eq!(mock.restarts(), 1);
    assert_eq!(mock.calls_named("ensure_display"), 2);
}

#[tokio::test]
async fn test_unrecoverable_channel_fails_task() {
    let mock = MockSurfaceService::new();
    let orch = orchestrator(&mock, launch_then_finish(Duration::ZERO));
    mock.set_always_dead(true);

    let report = orch
        .run_single(Task::new("打开 设置").with_max_steps(10), SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Errored);
    assert_eq!(report.status, TaskStatus::Failed);
    // 失败的这一步仍有记录
    assert_eq!(report.steps(), 1);
    assert!(!report.log[0].success);
    assert!(report.log[0].action.is_some());
    // 一次失败调用只重启一次、只重试一次
    assert_eq!(mock.restarts(), 1);
    assert_eq!(mock.calls_named("ensure_display"), 2);
}

#[tokio::test]
async fn test_every_iteration_is_logged() {
    let mock = MockSurfaceService::new();
    let llm = ScriptedLlmClient::with_results([
        Err("provider unavailable".to_string()),
        Ok("我不知道该做什么".to_string()),
        Ok("do(action=\"Launch\", app=\"设置\")".to_string()),
        Ok("do(action=\"Tap\", element=[500,500])".to_string()),
        Ok("finish(message=\"完成\")".to_string()),
    ])
    .into_arc();
    let orch = orchestrator(&mock, llm.clone());

    let report = orch.run_single(Task::new("打开设置"), SubmitOptions::default()).await.unwrap();
    assert!(report.success);
    assert_eq!(report.steps(), 5);
    assert_eq!(llm.calls(), 5);
    let indices: Vec<usize> = report.log.iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    assert!(report.log[0].action.is_none());
    assert!(!report.log[0].success);
    assert!(report.log[1].action.is_none());
    assert!(report.log[2].action.is_some());
    assert_eq!(mock.calls_named("tap"), 1);
}

#[tokio::test]
async fn test_sequential_batch_runs_one_after_another() {
    let mock = MockSurfaceService::new();
    let orch = orchestrator(&mock, launch_then_finish(Duration::ZERO));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let handle = orch
        .submit(
            vec![
                Task::new("打开 微信").with_target_app("微信"),
                Task::new("打开 设置").with_target_app("设置"),
            ],
            SubmitOptions {
                sequential: true,
                event_tx: Some(tx),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let ids = handle.session_ids().to_vec();
    let batch = handle.join().await;
    assert_eq!(batch.success_count, 2);

    let mut order = Vec::new();
    while let Ok(event) = rx.try_recv() {
        order.push(event.session_id);
    }
    let first_of_second = order.iter().position(|s| *s == ids[1]).expect("second ran");
    assert!(order[..first_of_second].iter().all(|s| *s == ids[0]));
    assert!(order[first_of_second..].iter().all(|s| *s == ids[1]));
}

/// 「切换」任务：启动自己的应用，切到任务文本最后一个词指定的会话，点一下，结束
fn switching_or_slow() -> std::sync::Arc<ScriptedLlmClient> {
    ScriptedLlmClient::from_fn(|messages| {
        let task = common::task_of(messages);
        let words: Vec<&str> = task.split_whitespace().collect();
        let app = words.get(1).copied().unwrap_or("设置");
        match common::turn_of(messages) {
            1 => Ok(format!("do(action=\"Launch\", app=\"{app}\")")),
            2 if task.contains("切换") => {
                let target = words.last().copied().unwrap_or_default();
                Ok(format!("do(action=\"Switch_surface\", session=\"{target}\")"))
            }
            3 if task.contains("切换") => Ok("do(action=\"Tap\", element=[500,500])".to_string()),
            _ if task.contains("慢") => Ok("do(action=\"Wait\", duration=\"0 seconds\")".to_string()),
            _ => Ok(format!("finish(message=\"{task} 完成\")")),
        }
    })
    .with_delay(Duration::from_millis(5))
    .into_arc()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_switch_into_running_session_is_refused() {
    let mock = MockSurfaceService::new();
    let orch = orchestrator(&mock, switching_or_slow());

    let busy = orch
        .submit(
            vec![Task::new("打开 微信 慢")
                .with_target_app("微信")
                .with_session("victim")
                .with_max_steps(500)],
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    let registry = orch.manager().registry().clone();
    let launched = wait_until(Duration::from_secs(5), || {
        let registry = registry.clone();
        async move { registry.surface_id("victim").await.is_some() }
    })
    .await;
    assert!(launched);
    let victim_surface = registry.surface_id("victim").await.unwrap();
    assert_eq!(orch.session_status("victim").await, Some(TaskStatus::Running));

    let report = orch
        .run_single(
            Task::new("打开 设置 切换 victim").with_target_app("设置"),
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    assert!(!report.log[1].success);
    assert!(report.log[1].message.contains("switch refused"));
    // 点击落在自己的虚拟屏上
    let own_surface = report.surface_id.expect("own surface");
    assert_ne!(own_surface, victim_surface);
    assert!(mock.calls_for(victim_surface).iter().all(|c| c.op != "tap"));
    assert_eq!(mock.calls_for(own_surface).iter().filter(|c| c.op == "tap").count(), 1);

    assert!(orch.cancel("victim").await);
    assert_eq!(busy.join().await.results[0].status, TaskStatus::Canceled);
    assert_eq!(orch.session_status("victim").await, Some(TaskStatus::Idle));
}

#[tokio::test]
async fn test_report_shows_surface_the_run_ended_on() {
    let mock = MockSurfaceService::new();
    let orch = orchestrator(&mock, switching_or_slow());

    let report = orch
        .run_single(
            Task::new("打开 设置 切换 spare").with_target_app("设置"),
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    assert!(report.success);
    assert!(report.log[1].success);
    let spare_surface = orch.manager().registry().surface_id("spare").await;
    assert!(spare_surface.is_some());
    assert_eq!(report.surface_id, spare_surface);
    assert_ne!(orch.manager().registry().surface_id(&report.session_id).await, spare_surface);
    // 运行结束后接管的会话一并释放
    assert!(!orch.supervisor().is_running("spare").await);
}
