//! Worker control loop: the single-threaded cooperative state machine that
//! drains the message queue and task backlog inside one execution
//! environment.
//!
//! States: `starting → idle ⇄ processing → stopping → stopped`. At most one
//! unit of work (one message or one backlog group) is ever in flight; the
//! only suspension points are the idle wait on the wake signal and the agent
//! subprocess itself. Interactive messages always drain before backlog
//! groups.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::backlog::{self, Backlog, MAX_GROUP_RETRIES};
use crate::buffer::OffsetBuffer;
use crate::errors::WorkError;
use crate::format;
use crate::logs::LogSink;
use crate::queue::MessageQueue;
use crate::repo::{RepoOps, RepoRef};
use crate::runner::AgentRunner;

/// Delay between reaching `stopped` and process exit, so a final status poll
/// can observe the terminal state before the environment disappears.
pub const STOP_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

/// Server-side lifecycle state, read by `/status` and webhook payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Starting,
    Idle,
    Processing,
    Stopping,
    Stopped,
}

/// Shutdown intent. Immediate wins over cooperative; neither downgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    None,
    Cooperative,
    Immediate,
}

/// Full `/status` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: ContainerState,
    pub queue_length: usize,
    pub pending_groups: usize,
    pub total_cost_usd: f64,
    pub iteration: u64,
    pub shutdown: ShutdownMode,
    pub revision: Option<String>,
    pub last_activity: DateTime<Utc>,
}

/// All process-wide mutable state, gathered into one explicit context so the
/// state machine is testable in isolation and multiple loops can coexist in
/// one test process.
pub struct ControlLoopContext {
    pub container_name: String,
    state: Mutex<ContainerState>,
    queue: Mutex<MessageQueue>,
    backlog: Backlog,
    events: Mutex<OffsetBuffer<Value>>,
    pub logs: LogSink,
    shutdown: Mutex<ShutdownMode>,
    wake: Notify,
    current_run: Mutex<Option<CancellationToken>>,
    total_cost: Mutex<f64>,
    iteration: Mutex<u64>,
    last_activity: Mutex<DateTime<Utc>>,
    webhook_url: Option<String>,
    http: reqwest::Client,
    pub workdir: PathBuf,
    runner: Arc<dyn AgentRunner>,
    repo: Arc<dyn RepoOps>,
    repo_ref: RepoRef,
}

impl ControlLoopContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        container_name: String,
        workdir: PathBuf,
        backlog: Backlog,
        logs: LogSink,
        webhook_url: Option<String>,
        runner: Arc<dyn AgentRunner>,
        repo: Arc<dyn RepoOps>,
        repo_ref: RepoRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            container_name,
            state: Mutex::new(ContainerState::Starting),
            queue: Mutex::new(MessageQueue::new()),
            backlog,
            events: Mutex::new(OffsetBuffer::new()),
            logs,
            shutdown: Mutex::new(ShutdownMode::None),
            wake: Notify::new(),
            current_run: Mutex::new(None),
            total_cost: Mutex::new(0.0),
            iteration: Mutex::new(0),
            last_activity: Mutex::new(Utc::now()),
            webhook_url,
            http: reqwest::Client::new(),
            workdir,
            runner,
            repo,
            repo_ref,
        })
    }

    /// Enqueue a prompt and wake the loop. Returns the message id.
    pub fn submit_message(&self, prompt: String) -> u64 {
        let id = self.lock_queue().submit(prompt);
        self.wake.notify_one();
        id
    }

    pub fn message(&self, id: u64) -> Option<crate::queue::MessageEntry> {
        self.lock_queue().get(id).cloned()
    }

    pub fn events_since(&self, offset: usize) -> (Vec<Value>, usize) {
        match self.events.lock() {
            Ok(buf) => buf.since(offset),
            Err(_) => (Vec::new(), offset),
        }
    }

    pub fn logs_since(&self, offset: usize) -> (Vec<String>, usize) {
        self.logs.since(offset)
    }

    /// Escalate the shutdown intent and wake the loop. A cooperative request
    /// never downgrades an immediate one.
    pub fn request_shutdown(&self, mode: ShutdownMode) {
        {
            let mut current = self.lock(&self.shutdown);
            if mode > *current {
                *current = mode;
            }
        }
        if mode == ShutdownMode::Immediate {
            self.interrupt_current();
        }
        self.wake.notify_one();
    }

    /// Cancel the in-flight agent run, if any. Returns whether anything was
    /// interrupted.
    pub fn interrupt_current(&self) -> bool {
        let guard = self.lock(&self.current_run);
        match guard.as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn state(&self) -> ContainerState {
        *self.lock(&self.state)
    }

    pub fn shutdown_mode(&self) -> ShutdownMode {
        *self.lock(&self.shutdown)
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let revision = self.repo.revision().await.ok();
        StatusSnapshot {
            state: self.state(),
            queue_length: self.lock_queue().pending_len(),
            pending_groups: self.backlog.pending().unwrap_or(0),
            total_cost_usd: *self.lock(&self.total_cost),
            iteration: *self.lock(&self.iteration),
            shutdown: self.shutdown_mode(),
            revision,
            last_activity: *self.lock(&self.last_activity),
        }
    }

    fn set_state(&self, state: ContainerState) {
        *self.lock(&self.state) = state;
        *self.lock(&self.last_activity) = Utc::now();
    }

    /// Record one raw agent event: formatted rendering goes to the log
    /// stream, the raw value to the event stream.
    pub fn record_event(&self, mut value: Value) {
        self.logs.redactor().redact_value(&mut value);
        if let Some(line) = format::render_event(&value) {
            for part in line.lines() {
                self.logs.line(part);
            }
        }
        if let Ok(mut buf) = self.events.lock() {
            buf.push(value);
        }
    }

    /// Best-effort lifecycle webhook. Delivery failure is logged and
    /// swallowed; the loop never blocks on it.
    fn notify_webhook(&self, event: &str, message_id: Option<u64>) {
        let Some(url) = self.webhook_url.clone() else {
            return;
        };
        let payload = serde_json::json!({
            "event": event,
            "container": self.container_name,
            "state": self.state(),
            "messageId": message_id,
        });
        let client = self.http.clone();
        tokio::spawn(async move {
            if let Err(e) = client.post(&url).json(&payload).send().await {
                tracing::debug!("webhook delivery failed: {e}");
            }
        });
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, MessageQueue> {
        self.lock(&self.queue)
    }

    // Lock poisoning cannot happen here (no panics while holding), but the
    // guard type forces a choice; recover the inner value either way.
    fn lock<'a, T>(&self, m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Run the control loop to completion. The caller transitions us out of
/// `starting` by invoking this once the HTTP server is listening and the
/// clone has finished.
pub async fn run(ctx: Arc<ControlLoopContext>) {
    ctx.set_state(ContainerState::Idle);
    ctx.logs.line("agent ready");
    let mut backlog_retries: u32 = 0;

    loop {
        if ctx.shutdown_mode() == ShutdownMode::Immediate {
            break;
        }

        // Interactive work first.
        let next_message = ctx.lock_queue().take_next();
        if let Some(entry) = next_message {
            process_message(&ctx, entry).await;
            continue;
        }

        let pending_group = match ctx.backlog.peek() {
            Ok(g) => g,
            Err(e) => {
                ctx.logs.line(&format!("backlog unreadable, skipping: {e:#}"));
                None
            }
        };
        if let Some(group) = pending_group {
            if ctx.shutdown_mode() == ShutdownMode::Immediate {
                break;
            }
            process_group(&ctx, group, &mut backlog_retries).await;
            continue;
        }

        // Queue and backlog are both empty.
        if ctx.shutdown_mode() != ShutdownMode::None {
            break;
        }
        ctx.wake.notified().await;
    }

    ctx.set_state(ContainerState::Stopping);
    ctx.notify_webhook("stopping", None);
    final_commit(&ctx).await;
    ctx.set_state(ContainerState::Stopped);
    ctx.logs.line("agent stopped");
}

async fn process_message(ctx: &Arc<ControlLoopContext>, entry: crate::queue::MessageEntry) {
    ctx.set_state(ContainerState::Processing);
    ctx.notify_webhook("processing", Some(entry.id));
    ctx.logs.line(&format!("processing message {}", entry.id));

    match run_agent(ctx, &entry.prompt).await {
        Ok(outcome) => {
            *ctx.lock(&ctx.total_cost) += outcome.cost_usd;
            ctx.lock_queue().complete(entry.id, outcome);
            ctx.notify_webhook("done", Some(entry.id));
            push_changes(ctx, &format::commit_summary(&entry.prompt)).await;
        }
        Err(e) => {
            ctx.logs.line(&format!("message {} failed: {e}", entry.id));
            ctx.lock_queue().fail(entry.id, e.to_string());
            ctx.notify_webhook("error", Some(entry.id));
        }
    }

    finish_iteration(ctx);
    ctx.notify_webhook("idle", None);
}

/// Process the head backlog group. Success with the completion sentinel
/// dequeues it; anything else retries up to [`MAX_GROUP_RETRIES`] and then
/// dequeues regardless so the backlog keeps moving.
async fn process_group(ctx: &Arc<ControlLoopContext>, group: backlog::Group, retries: &mut u32) {
    ctx.set_state(ContainerState::Processing);
    ctx.notify_webhook("processing", None);
    ctx.logs
        .line(&format!("processing backlog group: {}", group.strategy));

    let prompt = backlog::group_prompt(&group);
    let completed = match run_agent(ctx, &prompt).await {
        Ok(outcome) => {
            *ctx.lock(&ctx.total_cost) += outcome.cost_usd;
            backlog::signals_completion(&outcome.result)
        }
        Err(e) => {
            ctx.logs.line(&format!("group failed: {e}"));
            false
        }
    };

    if completed {
        *retries = 0;
        if let Err(e) = ctx.backlog.dequeue() {
            ctx.logs.line(&format!("failed to dequeue group: {e:#}"));
        }
        ctx.notify_webhook("done", None);
        push_changes(ctx, &format::commit_summary(&group.strategy)).await;
    } else {
        *retries += 1;
        if *retries >= MAX_GROUP_RETRIES {
            ctx.logs.line(&format!(
                "group '{}' did not complete after {} attempts, skipping",
                group.strategy, MAX_GROUP_RETRIES
            ));
            *retries = 0;
            if let Err(e) = ctx.backlog.dequeue() {
                ctx.logs.line(&format!("failed to dequeue group: {e:#}"));
            }
        }
        ctx.notify_webhook("error", None);
    }

    finish_iteration(ctx);
    ctx.notify_webhook("idle", None);
}

async fn run_agent(
    ctx: &Arc<ControlLoopContext>,
    prompt: &str,
) -> Result<crate::runner::RunOutcome, WorkError> {
    let token = CancellationToken::new();
    *ctx.lock(&ctx.current_run) = Some(token.clone());
    *ctx.lock(&ctx.iteration) += 1;

    let sink = |value: Value| ctx.record_event(value);
    let result = ctx
        .runner
        .run(prompt, &ctx.workdir, &sink, token)
        .await;

    *ctx.lock(&ctx.current_run) = None;
    result
}

async fn push_changes(ctx: &Arc<ControlLoopContext>, summary: &str) {
    match ctx
        .repo
        .commit_and_push(summary, &ctx.repo_ref.push_branch)
        .await
    {
        Ok(true) => ctx.logs.line(&format!("pushed: {summary}")),
        Ok(false) => {}
        Err(e) => ctx.logs.line(&format!("commit/push failed: {e}")),
    }
}

fn finish_iteration(ctx: &Arc<ControlLoopContext>) {
    if let Err(e) = ctx.logs.archive() {
        tracing::warn!("log archive failed: {e:#}");
    }
    ctx.set_state(ContainerState::Idle);
}

async fn final_commit(ctx: &Arc<ControlLoopContext>) {
    push_changes(ctx, "agent shutdown: flush uncommitted work").await;
}

#[cfg(test)]
mod tests;
