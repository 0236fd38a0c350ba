//! Strictly serial forwarder from submitted commands to the driver.
//!
//! The wire protocol carries no task correlation, so two overlapping writes
//! could have their replies attributed to the wrong command. This queue
//! exists purely to guarantee FIFO, one-at-a-time dispatch; it does not wait
//! for an ack; that happens asynchronously via the driver's outcome channel.

use std::sync::Mutex;

use serde_json::{Map as JsonMap, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::driver::Driver;
use crate::error::QueueError;

#[derive(Debug, Clone)]
pub struct QueuedCmd {
    pub task_id: String,
    pub cmd: String,
    pub params: JsonMap<String, Value>,
    pub timeout_ms: u64,
    pub assumable: bool,
}

struct WorkerState {
    tx: Option<mpsc::Sender<QueuedCmd>>,
    handle: Option<JoinHandle<()>>,
}

pub struct CmdQueue {
    driver: Driver,
    capacity: usize,
    state: Mutex<WorkerState>,
}

impl CmdQueue {
    pub fn new(driver: Driver, capacity: usize) -> Self {
        Self {
            driver,
            capacity: capacity.max(1),
            state: Mutex::new(WorkerState {
                tx: None,
                handle: None,
            }),
        }
    }

    /// Spawn the worker. Idempotent: calling `start` while already running
    /// does nothing.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        if state.tx.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        let driver = self.driver.clone();
        let handle = tokio::spawn(worker_loop(driver, rx));
        state.tx = Some(tx);
        state.handle = Some(handle);
    }

    /// Stop the worker. Any in-flight `send_cmd` the driver is already
    /// processing is allowed to run to completion; queued-but-unsent
    /// messages are dropped.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
        state.tx = None;
    }

    pub async fn push(&self, msg: QueuedCmd) -> Result<(), QueueError> {
        let tx = { self.state.lock().unwrap().tx.clone() };
        match tx {
            Some(tx) => tx.send(msg).await.map_err(|_| QueueError::Closed),
            None => Err(QueueError::Closed),
        }
    }
}

async fn worker_loop(driver: Driver, mut rx: mpsc::Receiver<QueuedCmd>) {
    while let Some(msg) = rx.recv().await {
        driver
            .enqueue_send(msg.task_id, msg.cmd, msg.timeout_ms, msg.assumable)
            .await;
    }
}
