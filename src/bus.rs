//! Peripheral-bus bridge.
//!
//! The bus master writes transactions of up to 32 bytes: one operation
//! tag followed by the payload. Record transactions are queued in the
//! mailbox for the main loop; a read request is answered directly with
//! the current time of day.

use arrayvec::ArrayVec;
use thiserror::Error;
use tracing::{debug, trace};

use crate::clock::{RtcTime, TimeOfDay, RTC_TIME_SIZE};
use crate::mailbox::{MailboxProducer, Operation, WORK_ITEM_PAYLOAD_SIZE};
use crate::wire::{EncodeError, Writer, MAX_PREFIXED_LEN};

/// Payload bytes a single transaction can carry after its tag.
pub const MAX_BUS_PAYLOAD: usize = WORK_ITEM_PAYLOAD_SIZE - 1;
pub const MAX_TRANSACTION_SIZE: usize = WORK_ITEM_PAYLOAD_SIZE;

pub type BusPayload = ArrayVec<u8, MAX_BUS_PAYLOAD>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("empty transaction")]
    EmptyTransaction,
    #[error("unknown operation tag {0}")]
    UnknownOperation(u8),
    #[error("payload of {0} bytes exceeds the {} byte bus limit", MAX_BUS_PAYLOAD)]
    PayloadTooLarge(usize),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] EncodeError),
}

/// One bus transaction: operation tag plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusFrame {
    pub operation: Operation,
    pub payload: BusPayload,
}

impl BusFrame {
    pub fn new(operation: Operation, payload: &[u8]) -> Result<Self, BusError> {
        let payload =
            BusPayload::try_from(payload).map_err(|_| BusError::PayloadTooLarge(payload.len()))?;
        Ok(Self { operation, payload })
    }

    pub fn parse(transaction: &[u8]) -> Result<Self, BusError> {
        let (&tag, payload) = transaction
            .split_first()
            .ok_or(BusError::EmptyTransaction)?;
        let operation = Operation::try_from(tag).map_err(BusError::UnknownOperation)?;
        Self::new(operation, payload)
    }

    pub fn to_bytes(&self) -> ArrayVec<u8, MAX_TRANSACTION_SIZE> {
        let mut out = ArrayVec::new();
        out.push(self.operation as u8);
        // payload is bounded by MAX_BUS_PAYLOAD, so this always fits
        out.extend(self.payload.iter().copied());
        out
    }

    /// Transaction preceded by its one-byte length, as carried over the
    /// TCP emulation of the bus.
    pub fn to_stream_bytes(&self) -> ArrayVec<u8, { MAX_TRANSACTION_SIZE + 1 }> {
        let bytes = self.to_bytes();
        let mut out = ArrayVec::new();
        out.push(bytes.len() as u8);
        out.extend(bytes);
        out
    }
}

/// Encodes into a scratch buffer large enough for any two prefixed
/// strings, then checks the result against the bus limit.
fn build(fill: impl FnOnce(&mut Writer<'_>) -> Result<(), EncodeError>) -> Result<BusPayload, BusError> {
    let mut scratch = [0u8; 2 * (MAX_PREFIXED_LEN + 1) + 8];
    let mut w = Writer::new(&mut scratch);
    fill(&mut w)?;
    let bytes = w.as_written();
    BusPayload::try_from(bytes).map_err(|_| BusError::PayloadTooLarge(bytes.len()))
}

/// Payload of a sender-record transaction.
pub fn sender_payload(callsign: &str, grid_locator: &str) -> Result<BusPayload, BusError> {
    build(|w| {
        w.write_length_prefixed(callsign.as_bytes())?;
        w.write_length_prefixed(grid_locator.as_bytes())
    })
}

/// Payload of a sender-software transaction.
pub fn software_payload(software: &str) -> Result<BusPayload, BusError> {
    build(|w| w.write_length_prefixed(software.as_bytes()))
}

/// Payload of a received-record transaction. The frequency travels
/// little-endian, as the bus master lays it out in memory.
pub fn received_payload(callsign: &str, frequency: u32, snr: i8) -> Result<BusPayload, BusError> {
    build(|w| {
        w.write_length_prefixed(callsign.as_bytes())?;
        w.write_all(&frequency.to_le_bytes())?;
        w.write_u8(snr.to_le_bytes()[0])
    })
}

/// Payload of a time-set transaction.
pub fn time_payload(time: &RtcTime) -> BusPayload {
    time.to_bytes().iter().copied().collect()
}

/// Callback side of the bus. Cloneable; every clone feeds the same
/// mailbox and reads the same time of day.
#[derive(Debug, Clone)]
pub struct BusBridge {
    producer: MailboxProducer,
    time_of_day: TimeOfDay,
}

impl BusBridge {
    pub fn new(producer: MailboxProducer, time_of_day: TimeOfDay) -> Self {
        Self {
            producer,
            time_of_day,
        }
    }

    /// Handles a write from the bus master. Returns the mailbox slot when
    /// something was queued. Never blocks; anything that cannot be queued
    /// is dropped.
    pub fn on_receive(&self, transaction: &[u8]) -> Option<usize> {
        let Some((&tag, payload)) = transaction.split_first() else {
            debug!("ignoring empty bus transaction");
            return None;
        };
        let operation = match Operation::try_from(tag) {
            Ok(operation) => operation,
            Err(tag) => {
                debug!("ignoring unknown operation tag {}", tag);
                return None;
            }
        };

        match operation {
            Operation::TimeRequest if payload.len() < RTC_TIME_SIZE => {
                trace!("time request, awaiting read");
                None
            }
            Operation::SendRequest => self.enqueue(Operation::SendRequest, &[]),
            operation if payload.is_empty() => {
                debug!("ignoring {:?} without payload", operation);
                None
            }
            operation => {
                if payload.len() > MAX_BUS_PAYLOAD {
                    debug!(
                        "{:?} payload of {} bytes cut to {}",
                        operation,
                        payload.len(),
                        MAX_BUS_PAYLOAD
                    );
                }
                self.enqueue(operation, &payload[..payload.len().min(MAX_BUS_PAYLOAD)])
            }
        }
    }

    /// Handles a read from the bus master.
    pub fn on_request(&self) -> [u8; RTC_TIME_SIZE] {
        self.time_of_day.get().to_bytes()
    }

    fn enqueue(&self, operation: Operation, payload: &[u8]) -> Option<usize> {
        match self.producer.post(operation, payload) {
            Ok(slot) => Some(slot),
            Err(err) => {
                debug!("dropped {:?}: {}", operation, err);
                None
            }
        }
    }

    pub fn time_of_day(&self) -> &TimeOfDay {
        &self.time_of_day
    }
}
