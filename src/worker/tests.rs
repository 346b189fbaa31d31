use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::errors::WorkError;
use crate::queue::MessageStatus;
use crate::redact::Redactor;
use crate::runner::{EventSink, RunOutcome};

/// Runner whose behavior per prompt is decided by a closure, with an
/// optional artificial delay so tests can observe the processing state.
struct ScriptedRunner {
    delay: Duration,
    runs: AtomicU32,
    concurrent: AtomicU32,
    max_concurrent: AtomicU32,
    respond: Box<dyn Fn(&str) -> Result<RunOutcome, WorkError> + Send + Sync>,
}

impl ScriptedRunner {
    fn new(
        delay: Duration,
        respond: impl Fn(&str) -> Result<RunOutcome, WorkError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            delay,
            runs: AtomicU32::new(0),
            concurrent: AtomicU32::new(0),
            max_concurrent: AtomicU32::new(0),
            respond: Box::new(respond),
        }
    }

    fn ok(text: &str) -> RunOutcome {
        RunOutcome {
            result: text.to_string(),
            cost_usd: 0.1,
            num_turns: 2,
        }
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn run(
        &self,
        prompt: &str,
        _workdir: &Path,
        events: EventSink<'_>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, WorkError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        events(serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": format!("working on: {prompt}")}]}
        }));

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(WorkError::Interrupted),
            _ = tokio::time::sleep(self.delay) => (self.respond)(prompt),
        };

        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Repo double recording commit summaries.
struct RecordingRepo {
    pushes: Mutex<Vec<String>>,
}

impl RecordingRepo {
    fn new() -> Self {
        Self {
            pushes: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RepoOps for RecordingRepo {
    async fn clone_repo(
        &self,
        _repo_ref: &RepoRef,
        _dest: &Path,
    ) -> Result<(), WorkError> {
        Ok(())
    }

    async fn checkout_branch(&self, _branch: &str) -> Result<(), WorkError> {
        Ok(())
    }

    async fn commit_and_push(&self, summary: &str, _branch: &str) -> Result<bool, WorkError> {
        self.pushes.lock().unwrap().push(summary.to_string());
        Ok(true)
    }

    async fn revision(&self) -> Result<String, WorkError> {
        Ok("abc1234".to_string())
    }
}

fn test_ctx(
    runner: Arc<ScriptedRunner>,
    backlog_dir: &Path,
) -> (Arc<ControlLoopContext>, Arc<RecordingRepo>) {
    let repo = Arc::new(RecordingRepo::new());
    let ctx = ControlLoopContext::new(
        "test-agent".to_string(),
        backlog_dir.to_path_buf(),
        Backlog::new(backlog_dir.join("backlog.json")),
        LogSink::memory(Redactor::default()),
        None,
        runner,
        repo.clone(),
        RepoRef {
            repo_url: "https://example.com/repo.git".into(),
            clone_branch: "main".into(),
            push_branch: "agent/work".into(),
        },
    );
    (ctx, repo)
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn messages_process_in_fifo_order() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new(Duration::from_millis(20), |p| {
        Ok(ScriptedRunner::ok(&format!("answer to {p}")))
    }));
    let (ctx, _repo) = test_ctx(runner, dir.path());

    let a = ctx.submit_message("first".into());
    let b = ctx.submit_message("second".into());
    let loop_handle = tokio::spawn(run(ctx.clone()));

    wait_for(
        || ctx.message(b).unwrap().status == MessageStatus::Done,
        "both messages done",
    )
    .await;

    let a_entry = ctx.message(a).unwrap();
    let b_entry = ctx.message(b).unwrap();
    assert_eq!(a_entry.status, MessageStatus::Done);
    assert_eq!(a_entry.result.unwrap().result, "answer to first");
    assert_eq!(b_entry.result.unwrap().result, "answer to second");

    ctx.request_shutdown(ShutdownMode::Cooperative);
    loop_handle.await.unwrap();
    assert_eq!(ctx.state(), ContainerState::Stopped);
}

#[tokio::test]
async fn at_most_one_unit_of_work_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new(Duration::from_millis(30), |_| {
        Ok(ScriptedRunner::ok("done"))
    }));
    let (ctx, _repo) = test_ctx(runner.clone(), dir.path());

    for i in 0..4 {
        ctx.submit_message(format!("msg {i}"));
    }
    let loop_handle = tokio::spawn(run(ctx.clone()));

    wait_for(|| runner.runs.load(Ordering::SeqCst) == 4, "all runs").await;
    assert_eq!(runner.max_concurrent.load(Ordering::SeqCst), 1);

    ctx.request_shutdown(ShutdownMode::Cooperative);
    loop_handle.await.unwrap();
}

#[tokio::test]
async fn failed_message_is_recorded_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new(Duration::from_millis(5), |p| {
        if p.contains("bad") {
            Err(WorkError::NonZeroExit {
                exit_code: 1,
                stderr: "agent crashed".into(),
            })
        } else {
            Ok(ScriptedRunner::ok("fine"))
        }
    }));
    let (ctx, _repo) = test_ctx(runner, dir.path());

    let bad = ctx.submit_message("bad prompt".into());
    let good = ctx.submit_message("good prompt".into());
    let loop_handle = tokio::spawn(run(ctx.clone()));

    wait_for(
        || ctx.message(good).unwrap().status == MessageStatus::Done,
        "good message done",
    )
    .await;

    let bad_entry = ctx.message(bad).unwrap();
    assert_eq!(bad_entry.status, MessageStatus::Error);
    assert!(bad_entry.error.unwrap().contains("agent crashed"));

    ctx.request_shutdown(ShutdownMode::Cooperative);
    loop_handle.await.unwrap();
}

#[tokio::test]
async fn detach_is_non_preemptive() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new(Duration::from_millis(80), |_| {
        Ok(ScriptedRunner::ok("slow answer"))
    }));
    let (ctx, _repo) = test_ctx(runner, dir.path());

    let id = ctx.submit_message("slow".into());
    let loop_handle = tokio::spawn(run(ctx.clone()));

    wait_for(|| ctx.state() == ContainerState::Processing, "processing").await;
    ctx.request_shutdown(ShutdownMode::Cooperative);

    loop_handle.await.unwrap();
    // The in-flight message completed before the loop stopped.
    assert_eq!(ctx.message(id).unwrap().status, MessageStatus::Done);
    assert_eq!(ctx.state(), ContainerState::Stopped);
}

#[tokio::test]
async fn stop_preempts_in_flight_work() {
    let dir = tempfile::tempdir().unwrap();
    // Long enough that only an interrupt can finish the test quickly.
    let runner = Arc::new(ScriptedRunner::new(Duration::from_secs(30), |_| {
        Ok(ScriptedRunner::ok("never"))
    }));
    let (ctx, _repo) = test_ctx(runner, dir.path());

    let id = ctx.submit_message("long running".into());
    let loop_handle = tokio::spawn(run(ctx.clone()));

    wait_for(|| ctx.state() == ContainerState::Processing, "processing").await;
    ctx.request_shutdown(ShutdownMode::Immediate);

    loop_handle.await.unwrap();
    let entry = ctx.message(id).unwrap();
    assert_eq!(entry.status, MessageStatus::Error);
    assert!(entry.error.unwrap().contains("interrupted"));
    assert_eq!(ctx.state(), ContainerState::Stopped);
}

#[tokio::test]
async fn interrupt_cancels_only_current_run() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new(Duration::from_secs(30), |_| {
        Ok(ScriptedRunner::ok("never"))
    }));
    let (ctx, _repo) = test_ctx(runner, dir.path());

    let id = ctx.submit_message("will be interrupted".into());
    let loop_handle = tokio::spawn(run(ctx.clone()));

    wait_for(|| ctx.state() == ContainerState::Processing, "processing").await;
    assert!(ctx.interrupt_current());

    wait_for(
        || ctx.message(id).unwrap().status == MessageStatus::Error,
        "message errored",
    )
    .await;
    // Loop survives the interrupt and returns to idle.
    wait_for(|| ctx.state() == ContainerState::Idle, "idle again").await;
    assert!(!ctx.interrupt_current());

    ctx.request_shutdown(ShutdownMode::Cooperative);
    loop_handle.await.unwrap();
}

#[tokio::test]
async fn backlog_group_retried_then_skipped() {
    let dir = tempfile::tempdir().unwrap();
    // Never emits the completion sentinel.
    let runner = Arc::new(ScriptedRunner::new(Duration::from_millis(5), |_| {
        Ok(ScriptedRunner::ok("made some progress"))
    }));
    let (ctx, _repo) = test_ctx(runner.clone(), dir.path());

    ctx.backlog
        .enqueue(backlog::Group {
            strategy: "docs/stuck.md".into(),
            jobs: vec!["impossible job".into()],
            timestamp: "2026-01-01T00:00:00Z".into(),
        })
        .unwrap();
    ctx.backlog
        .enqueue(backlog::Group {
            strategy: "docs/next.md".into(),
            jobs: vec!["another job".into()],
            timestamp: "2026-01-01T00:00:01Z".into(),
        })
        .unwrap();

    let loop_handle = tokio::spawn(run(ctx.clone()));
    // Stuck group runs MAX_GROUP_RETRIES times, then the next group runs
    // MAX_GROUP_RETRIES times, then the backlog is empty.
    wait_for(
        || ctx.backlog.pending().unwrap_or(99) == 0,
        "backlog drained",
    )
    .await;
    assert_eq!(runner.runs.load(Ordering::SeqCst), 2 * MAX_GROUP_RETRIES);

    let (lines, _) = ctx.logs_since(0);
    assert!(
        lines
            .iter()
            .any(|l| l.contains("docs/stuck.md") && l.contains("skipping")),
        "skip must be logged: {lines:?}"
    );

    ctx.request_shutdown(ShutdownMode::Cooperative);
    loop_handle.await.unwrap();
}

#[tokio::test]
async fn backlog_group_with_sentinel_completes_first_try() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new(Duration::from_millis(5), |_| {
        Ok(ScriptedRunner::ok("finished. ALL JOBS COMPLETE"))
    }));
    let (ctx, repo) = test_ctx(runner.clone(), dir.path());

    ctx.backlog
        .enqueue(backlog::Group {
            strategy: "docs/plan.md".into(),
            jobs: vec!["one job".into()],
            timestamp: "2026-01-01T00:00:00Z".into(),
        })
        .unwrap();

    let loop_handle = tokio::spawn(run(ctx.clone()));
    wait_for(|| ctx.backlog.pending().unwrap_or(99) == 0, "drained").await;
    assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

    ctx.request_shutdown(ShutdownMode::Cooperative);
    loop_handle.await.unwrap();
    // Completed group work was committed and pushed.
    assert!(
        repo.pushes
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.contains("docs/plan.md"))
    );
}

#[tokio::test]
async fn messages_preempt_backlog() {
    let dir = tempfile::tempdir().unwrap();
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let order_clone = order.clone();
    let runner = Arc::new(ScriptedRunner::new(Duration::from_millis(10), move |p| {
        order_clone.lock().unwrap().push(p.to_string());
        Ok(ScriptedRunner::ok("ok. ALL JOBS COMPLETE"))
    }));
    let (ctx, _repo) = test_ctx(runner, dir.path());

    ctx.backlog
        .enqueue(backlog::Group {
            strategy: "docs/background.md".into(),
            jobs: vec!["background job".into()],
            timestamp: "2026-01-01T00:00:00Z".into(),
        })
        .unwrap();
    ctx.submit_message("urgent question".into());

    let loop_handle = tokio::spawn(run(ctx.clone()));
    wait_for(|| ctx.backlog.pending().unwrap_or(99) == 0, "drained").await;

    let recorded = order.lock().unwrap().clone();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0], "urgent question");
    assert!(recorded[1].contains("docs/background.md"));

    ctx.request_shutdown(ShutdownMode::Cooperative);
    loop_handle.await.unwrap();
}

#[tokio::test]
async fn shutdown_mode_immediate_wins_over_cooperative() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new(Duration::from_millis(5), |_| {
        Ok(ScriptedRunner::ok("ok"))
    }));
    let (ctx, _repo) = test_ctx(runner, dir.path());

    ctx.request_shutdown(ShutdownMode::Immediate);
    ctx.request_shutdown(ShutdownMode::Cooperative);
    assert_eq!(ctx.shutdown_mode(), ShutdownMode::Immediate);
}

#[tokio::test]
async fn snapshot_reflects_queue_and_cost() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new(Duration::from_millis(5), |_| {
        Ok(ScriptedRunner::ok("ok"))
    }));
    let (ctx, _repo) = test_ctx(runner, dir.path());

    ctx.submit_message("one".into());
    let snap = ctx.snapshot().await;
    assert_eq!(snap.state, ContainerState::Starting);
    assert_eq!(snap.queue_length, 1);
    assert_eq!(snap.revision.as_deref(), Some("abc1234"));

    let loop_handle = tokio::spawn(run(ctx.clone()));
    wait_for(|| ctx.lock_queue().pending_len() == 0, "queue drained").await;
    wait_for(|| ctx.state() == ContainerState::Idle, "idle").await;

    let snap = ctx.snapshot().await;
    assert_eq!(snap.queue_length, 0);
    assert!(snap.total_cost_usd > 0.0);
    assert_eq!(snap.iteration, 1);

    ctx.request_shutdown(ShutdownMode::Cooperative);
    loop_handle.await.unwrap();
}

#[tokio::test]
async fn recorded_events_never_carry_secrets() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(RecordingRepo::new());
    let runner = Arc::new(ScriptedRunner::new(Duration::from_millis(5), |_| {
        Ok(ScriptedRunner::ok("ok"))
    }));
    let ctx = ControlLoopContext::new(
        "test-agent".to_string(),
        dir.path().to_path_buf(),
        Backlog::new(dir.path().join("backlog.json")),
        LogSink::memory(Redactor::new(["sk-ant-deadbeef42"])),
        None,
        runner,
        repo,
        RepoRef {
            repo_url: "https://example.com/repo.git".into(),
            clone_branch: "main".into(),
            push_branch: "agent/work".into(),
        },
    );

    ctx.record_event(serde_json::json!({
        "type": "assistant",
        "message": {"content": [{"type": "text", "text": "token sk-ant-deadbeef42 in use"}]}
    }));

    let (events, _) = ctx.events_since(0);
    assert_eq!(events.len(), 1);
    let serialized = serde_json::to_string(&events).unwrap();
    assert!(!serialized.contains("sk-ant-deadbeef42"));
    assert!(serialized.contains("[REDACTED]"));

    let (lines, _) = ctx.logs_since(0);
    assert!(lines.iter().all(|line| !line.contains("sk-ant-deadbeef42")));
}
