//! Print data transport
//! Writes opaque payloads to the printer characteristic of a live session.
//! One write is in flight per session; a second one is rejected.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{OwnedMutexGuard, broadcast, oneshot};

use crate::core::bluetooth::adapter::{RadioEvent, SharedAdapter, WriteRequest, next_event};
use crate::core::bluetooth::connection::Session;
use crate::core::bluetooth::error::{BleError, Result};
use crate::core::bluetooth::types::{CharacteristicId, GattStatus, WriteMode};

/// The characteristic a payload goes to, with the mode it accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteCharacteristicRef {
    pub id: CharacteristicId,
    /// `None` when the characteristic supports no write at all
    pub mode: Option<WriteMode>,
}

/// Writes print data through a session
pub struct Transport {
    adapter: SharedAdapter,
    target: CharacteristicId,
    write_timeout: Duration,
}

impl Transport {
    pub fn new(adapter: SharedAdapter, target: CharacteristicId, write_timeout: Duration) -> Self {
        Self {
            adapter,
            target,
            write_timeout,
        }
    }

    /// Finds the write characteristic on the session
    pub fn locate(&self, session: &Session) -> Option<WriteCharacteristicRef> {
        session
            .locate(&self.target)
            .map(|(id, characteristic)| WriteCharacteristicRef {
                id,
                mode: WriteMode::select(&characteristic.properties),
            })
    }

    /// Checks that a write can be issued now and takes the write gate.
    /// Nothing is sent to the radio.
    pub fn prepare(&self, session: &Arc<Session>) -> Result<PreparedWrite> {
        if !session.is_open() {
            return Err(BleError::NotConnected);
        }
        let gate = session.try_begin_write()?;
        let Some(characteristic) = self.locate(session) else {
            return Err(BleError::Unsupported(format!(
                "{} not found on {}",
                self.target,
                session.address()
            )));
        };
        let Some(mode) = characteristic.mode else {
            warn!("Characteristic {} on {} is not writable", characteristic.id, session.address());
            return Err(BleError::Unsupported("Connected device cannot print".to_string()));
        };

        Ok(PreparedWrite {
            adapter: self.adapter.clone(),
            session: session.clone(),
            characteristic: characteristic.id,
            mode,
            write_timeout: self.write_timeout,
            gate,
        })
    }

    /// Writes `payload` and waits for the platform to confirm it
    pub async fn send(&self, session: &Arc<Session>, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.prepare(session)?.send(payload).await
    }
}

/// A write that passed its checks and holds the session's write gate
pub struct PreparedWrite {
    adapter: SharedAdapter,
    session: Arc<Session>,
    characteristic: CharacteristicId,
    mode: WriteMode,
    write_timeout: Duration,
    gate: OwnedMutexGuard<()>,
}

impl PreparedWrite {
    /// Issues the write and waits for its callback. The write gate is held
    /// until the platform settles the write or the session closes, even
    /// when the caller gives up first.
    pub async fn send(self, payload: impl Into<Vec<u8>>) -> Result<()> {
        let PreparedWrite {
            adapter,
            session,
            characteristic,
            mode,
            write_timeout,
            gate,
        } = self;
        let payload = payload.into();
        let address = session.address().to_string();
        let limit = session.max_payload_len();
        if payload.len() > limit {
            warn!(
                "Payload of {} bytes exceeds the {} bytes the link carries per write",
                payload.len(),
                limit
            );
        }

        let request = WriteRequest::new(characteristic)
            .with_mode(mode)
            .with_payload(payload);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        tokio::spawn(Self::issue(adapter, session, request, gate, outcome_tx));

        let status = match tokio::time::timeout(write_timeout, outcome_rx).await {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(_)) => {
                return Err(BleError::Adapter(format!(
                    "write to {characteristic} ended without a result"
                )));
            }
            Err(_) => {
                warn!(
                    "No write callback from {} within {:?}, further writes wait for it",
                    address, write_timeout
                );
                return Err(BleError::Timeout(format!("write to {characteristic}")));
            }
        };

        match status {
            GattStatus::Success => {
                info!("Print data written to {}", address);
                Ok(())
            }
            GattStatus::InvalidAttributeLength => {
                warn!("Write exceeded connection ATT MTU!");
                Err(BleError::WriteFailed(status))
            }
            GattStatus::WriteNotPermitted => {
                warn!("Write not permitted on {}", characteristic);
                Err(BleError::WriteFailed(status))
            }
            GattStatus::Failure(code) => {
                warn!("Characteristic write failed with status {}", code);
                Err(BleError::WriteFailed(status))
            }
        }
    }

    /// Runs one write to completion on its own task and releases the gate
    /// once the write has settled.
    async fn issue(
        adapter: SharedAdapter,
        session: Arc<Session>,
        request: WriteRequest,
        gate: OwnedMutexGuard<()>,
        outcome_tx: oneshot::Sender<Result<GattStatus>>,
    ) {
        let address = session.address().to_string();
        let characteristic = request.characteristic;
        let mut events = adapter.subscribe();
        debug!(
            "Writing {} bytes to {} on {} ({:?})",
            request.payload.len(),
            characteristic,
            address,
            request.mode
        );

        let outcome = match adapter.write_characteristic(&address, request).await {
            Err(e) => Err(e),
            Ok(()) => tokio::select! {
                _ = session.closed() => Err(BleError::Disconnected),
                status = Self::wait_for_write(&mut events, &address, &characteristic) => status,
            },
        };
        drop(gate);

        if outcome_tx.send(outcome).is_err() {
            debug!("Abandoned write to {} on {} has settled", characteristic, address);
        }
    }

    /// Link loss is observed through the session's closed signal, which
    /// fires only after the session slot has been cleared.
    async fn wait_for_write(
        events: &mut broadcast::Receiver<RadioEvent>,
        address: &str,
        characteristic: &CharacteristicId,
    ) -> Result<GattStatus> {
        loop {
            if let RadioEvent::CharacteristicWritten {
                address: from,
                characteristic: written,
                status,
            } = next_event(events).await?
            {
                if from == address && written.characteristic == characteristic.characteristic {
                    return Ok(status);
                }
            }
        }
    }
}
