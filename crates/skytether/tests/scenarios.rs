//! End-to-end scenarios exercising the driver, command queue, scheduler, and
//! event bus together against a scriptable fake device, in place of a real
//! vehicle on the other end of the wire.

mod common;

use std::time::Duration;

use serde_json::{json, Map as JsonMap};
use tokio::sync::oneshot;
use tokio::time::sleep;

use skytether::scheduler::{STATUS_ERR_TIMEOUT, STATUS_OK};
use skytether::{
    CmdMsg, DriverConfig, EventBusConfig, MiddlewareConfig, MonitorConfig, SchedulerConfig, TaskCallback, TaskResult,
};

use common::FakeDevice;

fn test_config(fake_port: u16, scheduler: SchedulerConfig) -> MiddlewareConfig {
    MiddlewareConfig {
        driver: DriverConfig {
            remote_ip: "127.0.0.1".to_string(),
            remote_port: fake_port,
            local_port: 0,
        },
        scheduler,
        monitor: MonitorConfig::default(),
        event_bus: EventBusConfig::default(),
    }
}

fn fast_scheduler() -> SchedulerConfig {
    SchedulerConfig {
        retry_max: 2,
        backoff_ms: 30,
        grace_ms: 80,
        assume_ok_cmds: vec!["takeoff".to_string(), "land".to_string()],
    }
}

fn result_channel() -> (TaskCallback, oneshot::Receiver<TaskResult>) {
    let (tx, rx) = oneshot::channel();
    let cb: TaskCallback = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (cb, rx)
}

async fn recv_result(rx: oneshot::Receiver<TaskResult>) -> TaskResult {
    tokio::time::timeout(Duration::from_secs(3), rx)
        .await
        .expect("task callback timed out")
        .expect("task callback dropped")
}

#[tokio::test]
async fn happy_path_takeoff_acks_immediately() {
    let mut fake = FakeDevice::bind().await;
    let port = fake.port();
    let fake_task = tokio::spawn(async move {
        fake.accept_handshake().await;
        let line = fake.recv_line().await;
        assert_eq!(line, "takeoff");
        fake.reply("ok").await;
    });

    let mw = skytether::Middleware::new(test_config(port, fast_scheduler()));
    assert!(mw.driver.connect().await);
    mw.queue.start();

    let (cb, rx) = result_channel();
    mw.scheduler.submit(
        CmdMsg {
            task_id: "t-happy".to_string(),
            cmd: "takeoff".to_string(),
            params: JsonMap::new(),
            timeout_ms: 300,
        },
        Some(cb),
    );

    let result = recv_result(rx).await;
    assert_eq!(result.status, STATUS_OK);
    assert_eq!(result.detail.get("ack"), Some(&json!(true)));
    assert!(result.detail.get("assumed").is_none());

    fake_task.await.unwrap();
}

#[tokio::test]
async fn assumable_command_resolves_success_on_silence() {
    let mut fake = FakeDevice::bind().await;
    let port = fake.port();
    let fake_task = tokio::spawn(async move {
        fake.accept_handshake().await;
        let line = fake.recv_line().await;
        assert_eq!(line, "takeoff");
        // Never reply: takeoff is in assume_ok_cmds, so the device going
        // silent should still resolve as success once grace expires.
        sleep(Duration::from_millis(500)).await;
    });

    let mw = skytether::Middleware::new(test_config(port, fast_scheduler()));
    assert!(mw.driver.connect().await);
    mw.queue.start();

    let mut events = mw.bus.subscribe_event(None);

    let (cb, rx) = result_channel();
    mw.scheduler.submit(
        CmdMsg {
            task_id: "t-assumed".to_string(),
            cmd: "takeoff".to_string(),
            params: JsonMap::new(),
            timeout_ms: 100,
        },
        Some(cb),
    );

    let timeout_event = tokio::time::timeout(Duration::from_secs(2), events.next())
        .await
        .expect("timed out waiting for timeout event")
        .expect("event bus closed");
    assert_eq!(timeout_event.name, "timeout");

    let assumed_event = tokio::time::timeout(Duration::from_secs(2), events.next())
        .await
        .expect("timed out waiting for assumed event")
        .expect("event bus closed");
    assert_eq!(assumed_event.name, "ack_success_assumed");

    let result = recv_result(rx).await;
    assert_eq!(result.status, STATUS_OK);
    assert_eq!(result.detail.get("assumed"), Some(&json!(true)));

    fake_task.await.unwrap();
}

#[tokio::test]
async fn non_assumable_command_exhausts_retries_on_total_silence() {
    let mut fake = FakeDevice::bind().await;
    let port = fake.port();
    let fake_task = tokio::spawn(async move {
        fake.accept_handshake().await;
        // Every attempt sends the same line; swallow them all.
        for _ in 0..3 {
            let line = fake.recv_line().await;
            assert_eq!(line, "forward 30");
        }
    });

    let scheduler = SchedulerConfig {
        retry_max: 2,
        backoff_ms: 30,
        grace_ms: 50,
        assume_ok_cmds: vec!["takeoff".to_string(), "land".to_string()],
    };
    let mw = skytether::Middleware::new(test_config(port, scheduler));
    assert!(mw.driver.connect().await);
    mw.queue.start();

    let mut events = mw.bus.subscribe_event(None);

    let (cb, rx) = result_channel();
    mw.scheduler.submit(
        CmdMsg {
            task_id: "t-exhausted".to_string(),
            cmd: "forward 30".to_string(),
            params: JsonMap::new(),
            timeout_ms: 80,
        },
        Some(cb),
    );

    for _ in 0..3 {
        let ev = tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .expect("timed out waiting for timeout event")
            .expect("event bus closed");
        assert_eq!(ev.name, "timeout");
    }

    let result = tokio::time::timeout(Duration::from_secs(2), recv_result(rx))
        .await
        .expect("task callback timed out");
    assert_eq!(result.status, STATUS_ERR_TIMEOUT);

    fake_task.await.unwrap();
}

#[tokio::test]
async fn late_ack_inside_grace_window_still_completes_the_task() {
    let mut fake = FakeDevice::bind().await;
    let port = fake.port();
    let fake_task = tokio::spawn(async move {
        fake.accept_handshake().await;
        let line = fake.recv_line().await;
        assert_eq!(line, "forward 30");
        // Arrives after the scheduler's own per-attempt timeout, but well
        // inside the combined timeout+grace budget the driver listens for.
        fake.reply_after("ok", 140).await;
    });

    let scheduler = SchedulerConfig {
        retry_max: 2,
        backoff_ms: 30,
        grace_ms: 100,
        assume_ok_cmds: vec!["takeoff".to_string(), "land".to_string()],
    };
    let mw = skytether::Middleware::new(test_config(port, scheduler));
    assert!(mw.driver.connect().await);
    mw.queue.start();

    let mut events = mw.bus.subscribe_event(None);

    let (cb, rx) = result_channel();
    mw.scheduler.submit(
        CmdMsg {
            task_id: "t-late".to_string(),
            cmd: "forward 30".to_string(),
            params: JsonMap::new(),
            timeout_ms: 80,
        },
        Some(cb),
    );

    let timeout_event = tokio::time::timeout(Duration::from_secs(2), events.next())
        .await
        .expect("timed out waiting for timeout event")
        .expect("event bus closed");
    assert_eq!(timeout_event.name, "timeout");

    let success_event = tokio::time::timeout(Duration::from_secs(2), events.next())
        .await
        .expect("timed out waiting for ack_success event")
        .expect("event bus closed");
    assert_eq!(success_event.name, "ack_success");

    let result = recv_result(rx).await;
    assert_eq!(result.status, STATUS_OK);
    assert_eq!(result.detail.get("ack"), Some(&json!(true)));
    assert!(result.detail.get("assumed").is_none());

    fake_task.await.unwrap();
}

#[tokio::test]
async fn stray_datagram_is_drained_before_the_next_attempt() {
    let mut fake = FakeDevice::bind().await;
    let port = fake.port();
    let fake_task = tokio::spawn(async move {
        fake.accept_handshake().await;
        // A leftover datagram from some earlier exchange, sent before the
        // real command goes out. Left undrained it would satisfy the
        // "non-empty line" predicate and get mistaken for this attempt's
        // reply.
        fake.inject_stray("99").await;
        let line = fake.recv_line().await;
        assert_eq!(line, "forward 30");
        fake.reply("ok").await;
    });

    let mw = skytether::Middleware::new(test_config(port, fast_scheduler()));
    assert!(mw.driver.connect().await);
    // Give the stray datagram time to land in the socket's receive buffer
    // ahead of the real attempt's drain_stale sweep.
    sleep(Duration::from_millis(50)).await;
    mw.queue.start();

    let (cb, rx) = result_channel();
    mw.scheduler.submit(
        CmdMsg {
            task_id: "t-stray".to_string(),
            cmd: "forward 30".to_string(),
            params: JsonMap::new(),
            timeout_ms: 300,
        },
        Some(cb),
    );

    let result = recv_result(rx).await;
    assert_eq!(result.status, STATUS_OK);
    assert_eq!(result.detail.get("ack"), Some(&json!(true)));

    fake_task.await.unwrap();
}

#[tokio::test]
async fn reconnect_after_close_re_establishes_the_session() {
    let mut fake = FakeDevice::bind().await;
    let port = fake.port();
    let fake_task = tokio::spawn(async move {
        fake.accept_handshake().await;
        fake.accept_handshake().await;
    });

    let mw = skytether::Middleware::new(test_config(port, fast_scheduler()));
    assert!(mw.driver.connect().await);
    assert!(mw.driver.is_connected());

    mw.driver.close().await;
    assert!(!mw.driver.is_connected());

    assert!(mw.driver.reconnect_if_needed().await);
    assert!(mw.driver.is_connected());

    fake_task.await.unwrap();
}
