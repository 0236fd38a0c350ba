//! Task lifecycle: submit, enqueue, await ack, retry/grace/assume, deliver.
//!
//! Each submitted task runs its own attempt loop as a free-standing tokio
//! task. Correlation between a driver ack and the task awaiting it happens
//! through a one-shot slot registered in a shared table; the slot is never
//! cancelled so a late send from the driver's outcome channel can still
//! complete it after the awaiting side has moved into its grace window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Map as JsonMap, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::warn;

use crate::cmd_queue::{CmdQueue, QueuedCmd};
use crate::config::SchedulerConfig;
use crate::driver::AckOutcome;
use crate::event_bus::{EventBus, EventPayload};

pub const STATUS_OK: u32 = 0;
pub const STATUS_ERR_TIMEOUT: u32 = 1201;
pub const STATUS_ERR_GENERIC: u32 = 1500;

/// A command submitted by a caller, independent of the internal queue
/// representation (which additionally carries the computed `assumable` bit).
#[derive(Debug, Clone)]
pub struct CmdMsg {
    pub task_id: String,
    pub cmd: String,
    pub params: JsonMap<String, Value>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub status: u32,
    pub detail: JsonMap<String, Value>,
}

pub type TaskCallback = Box<dyn FnOnce(TaskResult) + Send + 'static>;

struct InFlightEntry {
    tx: Mutex<Option<oneshot::Sender<AckOutcome>>>,
    delivered: AtomicBool,
}

struct InFlightTable {
    entries: Mutex<HashMap<String, Arc<InFlightEntry>>>,
}

impl InFlightTable {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, task_id: &str) -> oneshot::Receiver<AckOutcome> {
        let (tx, rx) = oneshot::channel();
        let entry = Arc::new(InFlightEntry {
            tx: Mutex::new(Some(tx)),
            delivered: AtomicBool::new(false),
        });
        self.entries.lock().unwrap().insert(task_id.to_string(), entry);
        rx
    }

    fn remove(&self, task_id: &str) {
        self.entries.lock().unwrap().remove(task_id);
    }

    fn mark_delivered(&self, task_id: &str) {
        if let Some(entry) = self.entries.lock().unwrap().get(task_id) {
            entry.delivered.store(true, Ordering::Release);
        }
    }

    fn already_delivered(&self, task_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(task_id)
            .map(|e| e.delivered.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Deliver a driver outcome to whichever attempt registered this task_id.
    /// If nothing is registered the ack arrived for a task already resolved
    /// (or never known) and is logged as unmatched.
    fn deliver(&self, outcome: AckOutcome) {
        let task_id = outcome.task_id().to_string();
        let entry = { self.entries.lock().unwrap().get(&task_id).cloned() };
        match entry {
            Some(entry) => {
                let tx = entry.tx.lock().unwrap().take();
                if let Some(tx) = tx {
                    let _ = tx.send(outcome);
                } else {
                    warn!(task_id = %task_id, "ack arrived after slot already consumed");
                }
            }
            None => {
                warn!(task_id = %task_id, "ack_unmatched: no in-flight attempt for this task_id");
            }
        }
    }
}

async fn correlation_loop(table: Arc<InFlightTable>, mut outcome_rx: mpsc::Receiver<AckOutcome>) {
    while let Some(outcome) = outcome_rx.recv().await {
        table.deliver(outcome);
    }
}

fn task_ctx(task_id: &str) -> JsonMap<String, Value> {
    let mut m = JsonMap::new();
    m.insert("task_id".to_string(), json!(task_id));
    m
}

#[derive(Clone)]
pub struct TaskScheduler {
    queue: Arc<CmdQueue>,
    bus: Arc<EventBus>,
    config: SchedulerConfig,
    inflight: Arc<InFlightTable>,
}

impl TaskScheduler {
    pub fn new(queue: Arc<CmdQueue>, bus: Arc<EventBus>, config: SchedulerConfig, outcome_rx: mpsc::Receiver<AckOutcome>) -> Self {
        let inflight = Arc::new(InFlightTable::new());
        tokio::spawn(correlation_loop(inflight.clone(), outcome_rx));
        Self {
            queue,
            bus,
            config,
            inflight,
        }
    }

    fn is_assumable(&self, cmd: &str) -> bool {
        self.config
            .assume_ok_cmds
            .iter()
            .any(|c| c.eq_ignore_ascii_case(cmd.split_whitespace().next().unwrap_or(cmd)))
    }

    /// Spawn the attempt loop for this task and return immediately. `cb` is
    /// invoked exactly once, on its own task, regardless of outcome.
    pub fn submit(&self, msg: CmdMsg, cb: Option<TaskCallback>) {
        let queue = self.queue.clone();
        let bus = self.bus.clone();
        let inflight = self.inflight.clone();
        let config = self.config.clone();
        let assumable = self.is_assumable(&msg.cmd);
        tokio::spawn(run_task(msg, cb, queue, bus, inflight, config, assumable));
    }
}

fn dispatch(cb: Option<TaskCallback>, result: TaskResult) {
    if let Some(cb) = cb {
        tokio::spawn(async move {
            cb(result);
        });
    }
}

async fn publish_outcome_event(bus: &EventBus, outcome: &AckOutcome) {
    match outcome {
        AckOutcome::Ack { task_id } => {
            bus.publish_event(EventPayload::new(0, "ack_success", task_ctx(task_id))).await;
        }
        AckOutcome::AckAssumed { task_id } => {
            bus.publish_event(EventPayload::new(1, "ack_success_assumed", task_ctx(task_id)))
                .await;
        }
        AckOutcome::Fail { task_id, reason } => {
            let mut ctx = task_ctx(task_id);
            ctx.insert("reason".to_string(), json!(reason));
            bus.publish_event(EventPayload::new(2, "ack_fail", ctx)).await;
        }
        AckOutcome::NotConnected { .. } | AckOutcome::EmptyCmd { .. } => {}
    }
}

fn task_result_from_outcome(outcome: AckOutcome) -> TaskResult {
    match outcome {
        AckOutcome::Ack { task_id } => {
            let mut detail = task_ctx(&task_id);
            detail.insert("ack".to_string(), json!(true));
            TaskResult {
                task_id,
                status: STATUS_OK,
                detail,
            }
        }
        AckOutcome::AckAssumed { task_id } => {
            let mut detail = task_ctx(&task_id);
            detail.insert("ack".to_string(), json!(true));
            detail.insert("assumed".to_string(), json!(true));
            TaskResult {
                task_id,
                status: STATUS_OK,
                detail,
            }
        }
        AckOutcome::Fail { task_id, reason } => {
            let mut detail = task_ctx(&task_id);
            detail.insert("error".to_string(), json!(reason));
            TaskResult {
                task_id,
                status: STATUS_ERR_GENERIC,
                detail,
            }
        }
        AckOutcome::NotConnected { task_id } => {
            let mut detail = task_ctx(&task_id);
            detail.insert("error".to_string(), json!("not_connected"));
            TaskResult {
                task_id,
                status: STATUS_ERR_GENERIC,
                detail,
            }
        }
        AckOutcome::EmptyCmd { task_id } => {
            let mut detail = task_ctx(&task_id);
            detail.insert("error".to_string(), json!("empty_cmd"));
            TaskResult {
                task_id,
                status: STATUS_ERR_GENERIC,
                detail,
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_task(
    msg: CmdMsg,
    cb: Option<TaskCallback>,
    queue: Arc<CmdQueue>,
    bus: Arc<EventBus>,
    inflight: Arc<InFlightTable>,
    config: SchedulerConfig,
    assumable: bool,
) {
    let mut attempt_index: u32 = 0;

    loop {
        let rx = inflight.register(&msg.task_id);
        tokio::pin!(rx);

        // The driver listens on the wire for the full timeout+grace budget,
        // not just `msg.timeout_ms`: the two select!s below only govern when
        // *this* loop gives up waiting on the oneshot, not how long the
        // driver itself keeps the socket read open. Without the extra grace
        // margin here, a reply that lands during the scheduler's grace
        // window would already have been missed by the driver's own recv
        // deadline.
        let queued = QueuedCmd {
            task_id: msg.task_id.clone(),
            cmd: msg.cmd.clone(),
            params: msg.params.clone(),
            timeout_ms: msg.timeout_ms.saturating_add(config.grace_ms),
            assumable,
        };
        if queue.push(queued).await.is_err() {
            inflight.remove(&msg.task_id);
            let mut detail = task_ctx(&msg.task_id);
            detail.insert("error".to_string(), json!("queue_closed"));
            dispatch(
                cb,
                TaskResult {
                    task_id: msg.task_id,
                    status: STATUS_ERR_GENERIC,
                    detail,
                },
            );
            return;
        }

        let timeout_sleep = sleep(Duration::from_millis(msg.timeout_ms));
        tokio::pin!(timeout_sleep);

        let first = tokio::select! {
            res = &mut rx => Some(res),
            _ = &mut timeout_sleep => None,
        };

        if let Some(Ok(outcome)) = first {
            inflight.mark_delivered(&msg.task_id);
            inflight.remove(&msg.task_id);
            publish_outcome_event(&bus, &outcome).await;
            dispatch(cb, task_result_from_outcome(outcome));
            return;
        }

        bus.publish_event(EventPayload::new(2, "timeout", task_ctx(&msg.task_id))).await;

        let grace_sleep = sleep(Duration::from_millis(config.grace_ms));
        tokio::pin!(grace_sleep);

        let graced = tokio::select! {
            res = &mut rx => Some(res),
            _ = &mut grace_sleep => None,
        };

        if let Some(Ok(outcome)) = graced {
            let already = inflight.already_delivered(&msg.task_id);
            inflight.mark_delivered(&msg.task_id);
            inflight.remove(&msg.task_id);
            if !already {
                publish_outcome_event(&bus, &outcome).await;
                dispatch(cb, task_result_from_outcome(outcome));
            }
            return;
        }

        inflight.remove(&msg.task_id);

        if assumable {
            bus.publish_event(EventPayload::new(1, "ack_success_assumed", task_ctx(&msg.task_id)))
                .await;
            let mut detail = task_ctx(&msg.task_id);
            detail.insert("ack".to_string(), json!(true));
            detail.insert("assumed".to_string(), json!(true));
            dispatch(
                cb,
                TaskResult {
                    task_id: msg.task_id,
                    status: STATUS_OK,
                    detail,
                },
            );
            return;
        }

        if attempt_index >= config.retry_max {
            let mut detail = task_ctx(&msg.task_id);
            detail.insert("error".to_string(), json!("timeout"));
            dispatch(
                cb,
                TaskResult {
                    task_id: msg.task_id,
                    status: STATUS_ERR_TIMEOUT,
                    detail,
                },
            );
            return;
        }

        attempt_index += 1;
        sleep(Duration::from_millis(config.backoff_ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assumable_matches_first_word_case_insensitively() {
        let config = SchedulerConfig {
            assume_ok_cmds: vec!["takeoff".into(), "land".into()],
            ..Default::default()
        };
        let sched_check = |cmd: &str| {
            config
                .assume_ok_cmds
                .iter()
                .any(|c| c.eq_ignore_ascii_case(cmd.split_whitespace().next().unwrap_or(cmd)))
        };
        assert!(sched_check("TAKEOFF"));
        assert!(sched_check("land"));
        assert!(!sched_check("forward 30"));
    }
}
