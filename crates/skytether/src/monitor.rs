//! Periodic heartbeat, state publication, and self-healing reconnect.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Map as JsonMap};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::MonitorConfig;
use crate::driver::Driver;
use crate::event_bus::{EventBus, EventPayload, StatePayload};

struct RunState {
    handle: Option<JoinHandle<()>>,
    stop_tx: Option<watch::Sender<bool>>,
}

pub struct StateMonitor {
    driver: Driver,
    bus: Arc<EventBus>,
    config: MonitorConfig,
    run: Mutex<RunState>,
}

impl StateMonitor {
    pub fn new(driver: Driver, bus: Arc<EventBus>, config: MonitorConfig) -> Self {
        Self {
            driver,
            bus,
            config,
            run: Mutex::new(RunState {
                handle: None,
                stop_tx: None,
            }),
        }
    }

    pub fn start(&self) {
        let mut run = self.run.lock().unwrap();
        if run.handle.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(monitor_loop(self.driver.clone(), self.bus.clone(), self.config.clone(), stop_rx));
        run.handle = Some(handle);
        run.stop_tx = Some(stop_tx);
    }

    pub fn stop(&self) {
        let mut run = self.run.lock().unwrap();
        if let Some(tx) = run.stop_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = run.handle.take() {
            handle.abort();
        }
    }
}

async fn monitor_loop(driver: Driver, bus: Arc<EventBus>, config: MonitorConfig, mut stop_rx: watch::Receiver<bool>) {
    let period = Duration::from_millis(config.effective_period_ms());
    let max_fail = config.effective_max_heartbeat_fail();
    let mut fail_count: u32 = 0;

    loop {
        if *stop_rx.borrow() {
            return;
        }

        if driver.heartbeat().await {
            fail_count = 0;
            let battery = driver.last_battery().unwrap_or(-1);
            bus.publish_state(StatePayload {
                alt: 0.0,
                battery,
                lat: None,
                lon: None,
            })
            .await;
        } else {
            fail_count += 1;
            let mut ctx = JsonMap::new();
            ctx.insert("consecutive".to_string(), json!(fail_count));
            bus.publish_event(EventPayload::new(1, "heartbeat_fail", ctx)).await;

            if fail_count >= max_fail {
                bus.publish_event(EventPayload::new(2, "reconnect_try", JsonMap::new())).await;
                if driver.reconnect_if_needed().await {
                    bus.publish_event(EventPayload::new(0, "reconnect_success", JsonMap::new()))
                        .await;
                    fail_count = 0;
                } else {
                    bus.publish_event(EventPayload::new(3, "reconnect_fail", JsonMap::new())).await;
                }
            }
        }

        tokio::select! {
            _ = sleep(period) => {}
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return;
                }
            }
        }
    }
}
