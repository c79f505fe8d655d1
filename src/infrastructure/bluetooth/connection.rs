//! BLE Connection Module
//!
//! Owns the link lifecycle for one machine: connect with retry, heartbeat,
//! idle timeout and teardown. The machine firmware closes the link unless it
//! sees a write roughly every ten seconds, so while a keepalive deadline is
//! armed a background task keeps writing a dummy heartbeat frame.
//!
//! ```text
//! Disconnected ──keep_alive──▶ Connecting ──▶ Connected ──▶ Heartbeat ⇄ Sending
//!      ▲                           │ error                      │ deadline passed / error
//!      └──────── 1s delay ◀────────┴────────── Disconnecting ◀──┘
//! ```

use crate::error::LinkError;
use crate::infrastructure::bluetooth::command_channel::CommandSlot;
use crate::infrastructure::bluetooth::encryption::{self, EncryptionKey};
use crate::infrastructure::bluetooth::link::GattLink;
use crate::infrastructure::bluetooth::protocol::{MachineCharacteristic, HEARTBEAT_FRAME};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Configuration for link behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTiming {
    /// How long the link stays up after the last activity
    pub active_time: Duration,
    /// How long a latched command stays eligible for sending
    pub command_grace: Duration,
    /// Heartbeat period (10s is too late for the firmware)
    pub heartbeat_interval: Duration,
    /// Pause after a dropped or failed link before trying again
    pub reconnect_delay: Duration,
    pub connect_attempts: u32,
    /// Bound on a single connect or write
    pub connect_timeout: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            active_time: Duration::from_secs(120),
            command_grace: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(9),
            reconnect_delay: Duration::from_secs(1),
            connect_attempts: 3,
            connect_timeout: Duration::from_secs(20),
        }
    }
}

pub type ConnectivityCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct Schedule {
    deadline: Option<Instant>,
    running: bool,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    link: Arc<dyn GattLink>,
    key: EncryptionKey,
    timing: LinkTiming,
    schedule: Mutex<Schedule>,
    commands: CommandSlot,
    wake: Notify,
    connected: watch::Sender<bool>,
    on_connectivity: Mutex<Option<ConnectivityCallback>>,
}

/// Keeps the link to one machine alive while there is activity
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(link: Arc<dyn GattLink>, key: EncryptionKey, timing: LinkTiming) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                link,
                key,
                timing,
                schedule: Mutex::new(Schedule::default()),
                commands: CommandSlot::new(),
                wake: Notify::new(),
                connected,
                on_connectivity: Mutex::new(None),
            }),
        }
    }

    /// Register the handler told about every connectivity change
    pub fn set_connectivity_callback(&self, callback: ConnectivityCallback) {
        *self
            .inner
            .on_connectivity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(callback);
    }

    pub fn key(&self) -> EncryptionKey {
        self.inner.key
    }

    /// Keep the link up for the configured active time from now.
    ///
    /// Starts the link task if it is not running. Must be called from within
    /// a tokio runtime.
    pub fn keep_alive(&self) {
        self.keep_alive_for(self.inner.timing.active_time);
    }

    pub fn keep_alive_for(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut schedule = self.inner.schedule();
        schedule.deadline = Some(match schedule.deadline {
            Some(current) if current > deadline => current,
            _ => deadline,
        });

        if !schedule.running {
            debug!("Starting link task");
            schedule.running = true;
            schedule.task = Some(tokio::spawn(Inner::run(self.inner.clone())));
        }
    }

    /// Let the link close as soon as the heartbeat loop notices
    pub fn cancel_keep_alive(&self) {
        self.inner.schedule().deadline = None;
        self.inner.wake.notify_one();
    }

    /// Latch `payload` for the next heartbeat tick and wake the loop.
    /// An unsent earlier payload is replaced.
    pub fn send_once(&self, payload: Vec<u8>, characteristic: MachineCharacteristic) {
        self.inner
            .commands
            .latch(payload, characteristic, self.inner.timing.command_grace);
        self.keep_alive();
        self.inner.wake.notify_one();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.schedule().deadline
    }

    pub fn is_running(&self) -> bool {
        self.inner.schedule().running
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Wait up to `timeout` for the link to be established
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.connected.subscribe();
        let connected = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|connected| *connected)).await,
            Ok(Ok(_))
        );
        connected
    }

    pub fn link(&self) -> &dyn GattLink {
        self.inner.link.as_ref()
    }

    /// Cancel the keepalive and wait for the link task to finish
    pub async fn shutdown(&self) {
        self.cancel_keep_alive();
        let task = self.inner.schedule().task.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Link task ended abnormally: {}", e);
            }
        }
    }
}

impl Inner {
    fn schedule(&self) -> MutexGuard<'_, Schedule> {
        self.schedule
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_active(&self) -> bool {
        self.schedule()
            .deadline
            .is_some_and(|deadline| Instant::now() < deadline)
    }

    /// Mark the task stopped if the deadline has passed. Checked under the
    /// same lock `keep_alive` takes so a concurrent re-arm is never lost.
    fn release_if_idle(&self) -> bool {
        let mut schedule = self.schedule();
        let active = schedule
            .deadline
            .is_some_and(|deadline| Instant::now() < deadline);
        if !active {
            schedule.running = false;
        }
        !active
    }

    fn set_connected(&self, value: bool) {
        let changed = self.connected.send_if_modified(|connected| {
            if *connected == value {
                false
            } else {
                *connected = value;
                true
            }
        });
        if !changed {
            return;
        }

        let callback = self
            .on_connectivity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(value);
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.is_active() {
                match self.session().await {
                    Ok(()) => {}
                    Err(LinkError::Timeout(timeout)) => {
                        debug!("Link timed out after {:?}", timeout)
                    }
                    Err(LinkError::Ble(e)) => debug!("Link error: {}", e),
                    Err(e) => warn!("Link error: {}", e),
                }

                if let Err(e) = self.link.disconnect().await {
                    trace!("Disconnect failed: {}", e);
                }
                self.set_connected(false);
                tokio::time::sleep(self.timing.reconnect_delay).await;
            }

            if self.release_if_idle() {
                break;
            }
        }
        debug!("Link task stopped");
    }

    async fn session(&self) -> Result<(), LinkError> {
        self.connect_with_retry().await?;
        self.set_connected(true);
        info!("Connected to machine {}", self.link.address());

        while self.is_active() {
            self.flush_command().await?;
            self.heartbeat().await;
            self.idle().await;
        }

        debug!("Keepalive expired, closing link");
        Ok(())
    }

    async fn connect_with_retry(&self) -> Result<(), LinkError> {
        let mut last_error = LinkError::NotConnected;

        for attempt in 1..=self.timing.connect_attempts.max(1) {
            match self.bounded(self.link.connect()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("Connect attempt {} failed: {}", attempt, e);
                    last_error = e;
                }
            }

            if attempt < self.timing.connect_attempts && self.is_active() {
                tokio::time::sleep(self.timing.reconnect_delay * attempt).await;
            } else {
                break;
            }
        }

        Err(last_error)
    }

    /// Write the latched command if it is still fresh. A failed write keeps it
    /// latched for the next connection.
    async fn flush_command(&self) -> Result<(), LinkError> {
        let Some(command) = self.commands.peek_fresh() else {
            return Ok(());
        };

        let data = encryption::encrypt_frame(&command.payload, self.key);
        self.bounded(self.link.write(command.characteristic, &data))
            .await?;
        self.commands.complete(command.sequence);
        info!("Command sent to {:?}", command.characteristic);
        Ok(())
    }

    async fn heartbeat(&self) {
        let data = encryption::encrypt_frame(&HEARTBEAT_FRAME, self.key);
        match self
            .bounded(self.link.write(MachineCharacteristic::Heartbeat, &data))
            .await
        {
            Ok(()) => debug!("heartbeat sent"),
            // expected while the machine is switched off
            Err(e) => info!("heartbeat error: {}", e),
        }
    }

    /// Sleep until the next heartbeat, the deadline, or a wake-up
    async fn idle(&self) {
        let remaining = self
            .schedule()
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or_default();
        let wait = remaining.min(self.timing.heartbeat_interval);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = self.wake.notified() => trace!("Heartbeat wait interrupted"),
        }
    }

    async fn bounded<F>(&self, operation: F) -> Result<(), LinkError>
    where
        F: Future<Output = Result<(), LinkError>>,
    {
        tokio::time::timeout(self.timing.connect_timeout, operation)
            .await
            .map_err(|_| LinkError::Timeout(self.timing.connect_timeout))?
    }
}
