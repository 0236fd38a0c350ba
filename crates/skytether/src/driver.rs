//! Owns the UDP socket exclusively inside one reactor task and translates
//! API-level calls into wire bytes and back.
//!
//! Follows the same shape as a ZMQ reactor client: callers never touch the
//! socket directly, they send a command over an `mpsc` channel to the task
//! that does, and correlate replies by `task_id` rather than by holding a
//! lock across awaits.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::error::DriverError;

const RECV_BUF_LEN: usize = 512;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of a single `send_cmd` attempt, delivered to whoever is waiting on
/// the driver's outcome channel (normally the task scheduler).
#[derive(Debug, Clone)]
pub enum AckOutcome {
    Ack { task_id: String },
    AckAssumed { task_id: String },
    Fail { task_id: String, reason: String },
    NotConnected { task_id: String },
    EmptyCmd { task_id: String },
}

impl AckOutcome {
    pub fn task_id(&self) -> &str {
        match self {
            AckOutcome::Ack { task_id }
            | AckOutcome::AckAssumed { task_id }
            | AckOutcome::Fail { task_id, .. }
            | AckOutcome::NotConnected { task_id }
            | AckOutcome::EmptyCmd { task_id } => task_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AckOutcome::Ack { .. } | AckOutcome::AckAssumed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connected = 1,
}

impl ConnectionState {
    fn from_bool(connected: bool) -> Self {
        if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

enum ReactorCommand {
    Connect {
        resp_tx: oneshot::Sender<bool>,
    },
    SendCmd {
        task_id: String,
        cmd: String,
        timeout_ms: u64,
        assumable: bool,
    },
    Heartbeat {
        resp_tx: oneshot::Sender<bool>,
    },
    ReconnectIfNeeded {
        resp_tx: oneshot::Sender<bool>,
    },
    Close {
        resp_tx: oneshot::Sender<()>,
    },
}

/// Handle to the driver reactor. Cheap to clone; every clone shares the same
/// underlying socket task.
#[derive(Clone)]
pub struct Driver {
    cmd_tx: mpsc::Sender<ReactorCommand>,
    connected: Arc<AtomicBool>,
    last_battery: Arc<AtomicI64>,
}

const BATTERY_UNSET: i64 = i64::MIN;

impl Driver {
    /// Spawn the reactor task and return a handle plus the channel on which
    /// attempt outcomes are delivered (normally owned by the scheduler).
    pub fn new(config: DriverConfig) -> (Self, mpsc::Receiver<AckOutcome>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (outcome_tx, outcome_rx) = mpsc::channel(256);
        let connected = Arc::new(AtomicBool::new(false));
        let last_battery = Arc::new(AtomicI64::new(BATTERY_UNSET));

        tokio::spawn(reactor_task(
            config,
            cmd_rx,
            outcome_tx,
            connected.clone(),
            last_battery.clone(),
        ));

        (
            Driver {
                cmd_tx,
                connected,
                last_battery,
            },
            outcome_rx,
        )
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_bool(self.connected.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn last_battery(&self) -> Option<i64> {
        match self.last_battery.load(Ordering::Acquire) {
            BATTERY_UNSET => None,
            v => Some(v),
        }
    }

    /// Enter SDK mode. Returns true on `ok`.
    pub async fn connect(&self) -> bool {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self.cmd_tx.send(ReactorCommand::Connect { resp_tx }).await.is_err() {
            return false;
        }
        resp_rx.await.unwrap_or(false)
    }

    /// Hand a command to the reactor and return once it's been accepted onto
    /// the reactor's channel; the ack itself arrives later on the outcome
    /// channel handed back from `new`. Callers that need FIFO wire ordering
    /// (the command queue's worker) must `.await` this directly rather than
    /// spawning it, since spawning would let two calls race for the reactor
    /// channel and reorder the wire writes.
    pub async fn enqueue_send(&self, task_id: String, cmd: String, timeout_ms: u64, assumable: bool) {
        if self
            .cmd_tx
            .send(ReactorCommand::SendCmd {
                task_id,
                cmd,
                timeout_ms,
                assumable,
            })
            .await
            .is_err()
        {
            warn!("driver reactor gone, dropping send_cmd");
        }
    }

    pub async fn heartbeat(&self) -> bool {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ReactorCommand::Heartbeat { resp_tx })
            .await
            .is_err()
        {
            return false;
        }
        resp_rx.await.unwrap_or(false)
    }

    pub async fn reconnect_if_needed(&self) -> bool {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ReactorCommand::ReconnectIfNeeded { resp_tx })
            .await
            .is_err()
        {
            return false;
        }
        resp_rx.await.unwrap_or(false)
    }

    pub async fn close(&self) {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self.cmd_tx.send(ReactorCommand::Close { resp_tx }).await.is_ok() {
            let _ = resp_rx.await;
        }
    }
}

struct ReactorState {
    remote: SocketAddr,
    local_port: u16,
    socket: Option<UdpSocket>,
    connected: Arc<AtomicBool>,
    last_battery: Arc<AtomicI64>,
}

impl ReactorState {
    fn set_connected(&self, value: bool) {
        self.connected.store(value, Ordering::Release);
    }

    async fn ensure_socket(&mut self) -> Result<(), DriverError> {
        if self.socket.is_some() {
            return Ok(());
        }
        let bind_addr: SocketAddr = ([0, 0, 0, 0], self.local_port).into();
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| DriverError::Bind(self.local_port, e))?;
        socket.connect(self.remote).await?;
        self.socket = Some(socket);
        Ok(())
    }

    fn drain_stale(&self) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        let mut buf = [0u8; RECV_BUF_LEN];
        let mut drained = 0;
        while socket.try_recv(&mut buf).is_ok() {
            drained += 1;
            if drained > 64 {
                break;
            }
        }
    }

    async fn send_line(&self, line: &str) -> std::io::Result<()> {
        let socket = self.socket.as_ref().expect("socket must be connected");
        socket.send(line.as_bytes()).await?;
        Ok(())
    }

    async fn recv_matching<F>(&self, deadline: Instant, predicate: F) -> Option<String>
    where
        F: Fn(&str) -> bool,
    {
        let socket = self.socket.as_ref()?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let mut buf = [0u8; RECV_BUF_LEN];
            match timeout(remaining, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    let line = String::from_utf8_lossy(&buf[..n]).trim().to_string();
                    if predicate(&line) {
                        return Some(line);
                    }
                    debug!(%line, "stray reply ignored while waiting for match");
                }
                _ => return None,
            }
        }
    }

    async fn do_connect(&mut self) -> bool {
        if self.ensure_socket().await.is_err() {
            self.set_connected(false);
            return false;
        }
        self.drain_stale();
        if self.send_line("command").await.is_err() {
            self.set_connected(false);
            return false;
        }
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        let reply = self
            .recv_matching(deadline, |l| {
                l.eq_ignore_ascii_case("ok") || l.eq_ignore_ascii_case("error")
            })
            .await;
        let ok = matches!(reply, Some(l) if l.eq_ignore_ascii_case("ok"));
        self.set_connected(ok);
        ok
    }

    async fn do_heartbeat(&mut self) -> bool {
        if !self.connected.load(Ordering::Acquire) {
            return false;
        }
        self.drain_stale();
        if self.send_line("battery?").await.is_err() {
            return false;
        }
        let deadline = Instant::now() + HEARTBEAT_TIMEOUT;
        let reply = self
            .recv_matching(deadline, |l| !l.is_empty() && l.bytes().all(|b| b.is_ascii_digit()))
            .await;
        match reply {
            Some(line) => {
                if let Ok(v) = line.parse::<i64>() {
                    self.last_battery.store(v, Ordering::Release);
                }
                true
            }
            None => false,
        }
    }

    /// Run one wire attempt. Returns `None` when a non-assumable command gets
    /// no reply at all within the deadline: the driver has nothing definitive
    /// to report, so it stays silent and leaves the outcome to whichever
    /// timeout/grace/retry policy the caller layers on top, rather than
    /// racing that policy with its own "timeout" verdict.
    async fn do_send_cmd(
        &mut self,
        task_id: String,
        cmd: String,
        timeout_ms: u64,
        assumable: bool,
    ) -> Option<AckOutcome> {
        if cmd.is_empty() {
            return Some(AckOutcome::EmptyCmd { task_id });
        }
        if !self.connected.load(Ordering::Acquire) {
            self.do_connect().await;
            if !self.connected.load(Ordering::Acquire) {
                return Some(AckOutcome::NotConnected { task_id });
            }
        }
        self.drain_stale();
        if self.send_line(&cmd).await.is_err() {
            return Some(AckOutcome::NotConnected { task_id });
        }
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let reply = self.recv_matching(deadline, |l| !l.is_empty()).await;
        match reply {
            Some(line) if line.eq_ignore_ascii_case("ok") => Some(AckOutcome::Ack { task_id }),
            Some(line) => Some(AckOutcome::Fail { task_id, reason: line }),
            None if assumable => {
                info!(cmd = %cmd, task_id = %task_id, "timed out, assuming success");
                Some(AckOutcome::AckAssumed { task_id })
            }
            None => {
                debug!(cmd = %cmd, task_id = %task_id, "timed out, no verdict to report");
                None
            }
        }
    }
}

async fn reactor_task(
    config: DriverConfig,
    mut cmd_rx: mpsc::Receiver<ReactorCommand>,
    outcome_tx: mpsc::Sender<AckOutcome>,
    connected: Arc<AtomicBool>,
    last_battery: Arc<AtomicI64>,
) {
    let remote: SocketAddr = match format!("{}:{}", config.remote_ip, config.remote_port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, "invalid remote address, driver reactor exiting");
            return;
        }
    };

    let mut state = ReactorState {
        remote,
        local_port: config.local_port,
        socket: None,
        connected,
        last_battery,
    };

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            ReactorCommand::Connect { resp_tx } => {
                let ok = state.do_connect().await;
                let _ = resp_tx.send(ok);
            }
            ReactorCommand::SendCmd {
                task_id,
                cmd,
                timeout_ms,
                assumable,
            } => {
                if let Some(outcome) = state.do_send_cmd(task_id, cmd, timeout_ms, assumable).await {
                    if outcome_tx.send(outcome).await.is_err() {
                        warn!("outcome receiver gone, dropping ack");
                    }
                }
            }
            ReactorCommand::Heartbeat { resp_tx } => {
                let ok = state.do_heartbeat().await;
                let _ = resp_tx.send(ok);
            }
            ReactorCommand::ReconnectIfNeeded { resp_tx } => {
                let ok = if state.connected.load(Ordering::Acquire) {
                    true
                } else {
                    state.do_connect().await
                };
                let _ = resp_tx.send(ok);
            }
            ReactorCommand::Close { resp_tx } => {
                state.socket = None;
                state.set_connected(false);
                let _ = resp_tx.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_outcome_success_classification() {
        assert!(AckOutcome::Ack {
            task_id: "t".into()
        }
        .is_success());
        assert!(AckOutcome::AckAssumed {
            task_id: "t".into()
        }
        .is_success());
        assert!(!AckOutcome::Fail {
            task_id: "t".into(),
            reason: "x".into()
        }
        .is_success());
        assert!(!AckOutcome::NotConnected {
            task_id: "t".into()
        }
        .is_success());
    }

    #[test]
    fn task_id_extraction() {
        let o = AckOutcome::Fail {
            task_id: "abc".into(),
            reason: "boom".into(),
        };
        assert_eq!(o.task_id(), "abc");
    }
}
