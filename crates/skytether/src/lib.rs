//! Middleware core for a UDP-speaking aerial vehicle: driver, command queue,
//! task scheduler, event bus, and state monitor, wired together behind one
//! [`Middleware`] handle.

pub mod cmd_queue;
pub mod config;
pub mod driver;
pub mod error;
pub mod event_bus;
pub mod monitor;
pub mod scheduler;

use std::sync::Arc;

pub use cmd_queue::{CmdQueue, QueuedCmd};
pub use config::{DriverConfig, EventBusConfig, MiddlewareConfig, MonitorConfig, SchedulerConfig};
pub use driver::{AckOutcome, ConnectionState, Driver};
pub use error::{ConfigError, DriverError, QueueError};
pub use event_bus::{EventBus, EventPayload, StatePayload, Subscription};
pub use monitor::StateMonitor;
pub use scheduler::{CmdMsg, TaskCallback, TaskResult, TaskScheduler};

/// Owns every component and their wiring; construct one per vehicle
/// connection.
pub struct Middleware {
    pub driver: Driver,
    pub queue: Arc<CmdQueue>,
    pub scheduler: TaskScheduler,
    pub bus: Arc<EventBus>,
    pub monitor: Arc<StateMonitor>,
}

impl Middleware {
    pub fn new(config: MiddlewareConfig) -> Self {
        let (driver, outcome_rx) = Driver::new(config.driver);
        let bus = Arc::new(EventBus::new(
            config.event_bus.subscriber_maxsize,
            config.event_bus.drop_policy,
        ));
        let queue = Arc::new(CmdQueue::new(driver.clone(), 128));
        let scheduler = TaskScheduler::new(queue.clone(), bus.clone(), config.scheduler, outcome_rx);
        let monitor = Arc::new(StateMonitor::new(driver.clone(), bus.clone(), config.monitor));

        Self {
            driver,
            queue,
            scheduler,
            bus,
            monitor,
        }
    }

    /// Enter SDK mode, then start the command queue worker and heartbeat
    /// monitor. Returns whether the initial handshake succeeded; the queue
    /// and monitor are started regardless so that a later `reconnect_if_needed`
    /// can recover.
    pub async fn start(&self) -> bool {
        let connected = self.driver.connect().await;
        self.queue.start();
        self.monitor.start();
        connected
    }

    pub async fn shutdown(&self) {
        self.monitor.stop();
        self.queue.stop();
        self.driver.close().await;
        self.bus.shutdown();
    }
}
