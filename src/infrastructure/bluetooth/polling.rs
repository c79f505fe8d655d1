//! Polling Reader
//!
//! The machine answers statistics and status requests asynchronously: the
//! host writes a request, then polls a characteristic until a readiness byte
//! changes, then reads the result. Transport errors during polling only mean
//! "not ready yet".

use crate::error::{LinkError, ReadError};
use crate::infrastructure::bluetooth::encryption::{self, EncryptionKey};
use crate::infrastructure::bluetooth::link::GattLink;
use crate::infrastructure::bluetooth::protocol::MachineCharacteristic;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Retry limits for polling reads and checked writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub write_attempts: u32,
    /// Per-attempt write timeout
    pub write_timeout: Duration,
    /// How long a read waits for the link to come up
    pub connect_wait: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval: Duration::from_millis(800),
            write_attempts: 30,
            write_timeout: Duration::from_secs(2),
            connect_wait: Duration::from_secs(20),
        }
    }
}

/// Readiness condition: the decrypted byte at `offset` must differ from `forbidden`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyCheck {
    pub offset: usize,
    pub forbidden: u8,
}

impl ReadyCheck {
    fn accepts(&self, data: &[u8]) -> bool {
        data.get(self.offset)
            .is_some_and(|value| *value != self.forbidden)
    }
}

pub struct PollingReader<'a> {
    link: &'a dyn GattLink,
    key: EncryptionKey,
    policy: PollPolicy,
}

impl<'a> PollingReader<'a> {
    pub fn new(link: &'a dyn GattLink, key: EncryptionKey, policy: PollPolicy) -> Self {
        Self { link, key, policy }
    }

    /// Read and decrypt `characteristic` until `check` accepts it.
    ///
    /// Without a check the first successful read is returned. Running out of
    /// attempts yields [`ReadError::Timeout`].
    pub async fn poll_until_ready(
        &self,
        characteristic: MachineCharacteristic,
        check: Option<ReadyCheck>,
    ) -> Result<Vec<u8>, ReadError> {
        for attempt in 1..=self.policy.max_attempts {
            match self.link.read(characteristic).await {
                Ok(raw) => {
                    let data = encryption::transform(&raw, self.key);
                    match check {
                        Some(check) if !check.accepts(&data) => {
                            trace!(
                                "{:?} not ready (attempt {}): {:02X?}",
                                characteristic,
                                attempt,
                                data
                            );
                        }
                        _ => return Ok(data),
                    }
                }
                Err(e) => {
                    debug!(
                        "Read of {:?} failed (attempt {}): {}",
                        characteristic, attempt, e
                    );
                }
            }

            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.interval).await;
            }
        }

        warn!(
            "{:?} not ready after {} attempts",
            characteristic, self.policy.max_attempts
        );
        Err(ReadError::Timeout {
            attempts: self.policy.max_attempts,
        })
    }

    /// Encrypt and write `frame`, retrying on failure
    pub async fn write_checked(
        &self,
        characteristic: MachineCharacteristic,
        frame: &[u8],
    ) -> Result<(), LinkError> {
        let data = encryption::encrypt_frame(frame, self.key);
        let mut last_error = LinkError::NotConnected;

        for attempt in 1..=self.policy.write_attempts {
            match tokio::time::timeout(
                self.policy.write_timeout,
                self.link.write(characteristic, &data),
            )
            .await
            {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    debug!(
                        "Write to {:?} failed (attempt {}): {}",
                        characteristic, attempt, e
                    );
                    last_error = e;
                }
                Err(_) => {
                    debug!("Write to {:?} timed out (attempt {})", characteristic, attempt);
                    last_error = LinkError::Timeout(self.policy.write_timeout);
                }
            }

            if attempt < self.policy.write_attempts {
                tokio::time::sleep(self.policy.interval).await;
            }
        }

        Err(last_error)
    }
}
