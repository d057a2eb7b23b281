//! Bounded mailbox between the bus callback and the main loop.
//!
//! A fixed pool of [`MAX_WORK_ITEMS`] slots holds the payloads; a FIFO of
//! slot indices orders them. Producers never wait: when every slot is in
//! use the request is dropped. The single consumer polls without
//! blocking and handles at most one item per call.
//!
//! The slot pool is the only state shared between the two contexts and
//! is guarded by one mutex.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use static_assertions::{const_assert, const_assert_eq};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, trace, warn};

pub const MAX_WORK_ITEMS: usize = 20;
pub const WORK_ITEM_PAYLOAD_SIZE: usize = 32;

const_assert!(MAX_WORK_ITEMS <= u8::MAX as usize);
const_assert!(WORK_ITEM_PAYLOAD_SIZE <= u8::MAX as usize);

pub type Payload = [u8; WORK_ITEM_PAYLOAD_SIZE];

const_assert_eq!(core::mem::size_of::<Payload>(), 32);

/// Operation tags shared by the bus protocol and the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Operation {
    TimeRequest = 0,
    SenderRecord = 1,
    SenderSoftwareRecord = 2,
    ReceivedRecord = 3,
    SendRequest = 4,
}

impl TryFrom<u8> for Operation {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Operation::TimeRequest),
            1 => Ok(Operation::SenderRecord),
            2 => Ok(Operation::SenderSoftwareRecord),
            3 => Ok(Operation::ReceivedRecord),
            4 => Ok(Operation::SendRequest),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MailboxError {
    #[error("all {} work items are in use", MAX_WORK_ITEMS)]
    Exhausted,
    #[error("mailbox consumer has gone away")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Allocated,
}

#[derive(Debug, Clone, Copy)]
struct WorkItem {
    state: SlotState,
    operation: Operation,
    len: u8,
    payload: Payload,
}

impl WorkItem {
    const EMPTY: Self = Self {
        state: SlotState::Free,
        operation: Operation::SendRequest,
        len: 0,
        payload: [0; WORK_ITEM_PAYLOAD_SIZE],
    };
}

#[derive(Debug)]
struct SlotPool {
    items: [WorkItem; MAX_WORK_ITEMS],
}

impl SlotPool {
    fn allocate(&mut self) -> Option<usize> {
        let index = self
            .items
            .iter()
            .position(|item| item.state == SlotState::Free)?;
        self.items[index].state = SlotState::Allocated;
        Some(index)
    }

    fn in_use(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.state == SlotState::Allocated)
            .count()
    }
}

#[derive(Debug)]
struct Shared {
    pool: Mutex<SlotPool>,
    dropped: AtomicU32,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SlotPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One dequeued item, copied out of its slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub slot: usize,
    pub operation: Operation,
    /// Bytes actually posted; the rest of `payload` is zero padding.
    pub len: usize,
    pub payload: Payload,
}

impl Delivery {
    /// The posted bytes, without the slot padding.
    pub fn bytes(&self) -> &[u8] {
        &self.payload[..self.len]
    }
}

pub struct Mailbox;

impl Mailbox {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (MailboxProducer, MailboxConsumer) {
        let shared = Arc::new(Shared {
            pool: Mutex::new(SlotPool {
                items: [WorkItem::EMPTY; MAX_WORK_ITEMS],
            }),
            dropped: AtomicU32::new(0),
        });
        let (tx, rx) = mpsc::channel(MAX_WORK_ITEMS);
        (
            MailboxProducer {
                shared: Arc::clone(&shared),
                tx,
            },
            MailboxConsumer { shared, rx },
        )
    }
}

/// Producer handle. Cheap to clone; safe to use from any thread.
#[derive(Debug, Clone)]
pub struct MailboxProducer {
    shared: Arc<Shared>,
    tx: mpsc::Sender<u8>,
}

impl MailboxProducer {
    /// Queues `operation` with up to 32 bytes of `payload`, zero-padding
    /// the rest of the slot. Returns the slot index.
    ///
    /// Never blocks. When no slot is free the request is dropped and
    /// counted.
    pub fn post(&self, operation: Operation, payload: &[u8]) -> Result<usize, MailboxError> {
        if payload.len() > WORK_ITEM_PAYLOAD_SIZE {
            warn!(
                "payload of {} bytes for {:?} truncated to {}",
                payload.len(),
                operation,
                WORK_ITEM_PAYLOAD_SIZE
            );
        }
        let payload: ArrayVec<u8, WORK_ITEM_PAYLOAD_SIZE> = payload
            .iter()
            .copied()
            .take(WORK_ITEM_PAYLOAD_SIZE)
            .collect();

        let index = {
            let mut pool = self.shared.lock();
            let Some(index) = pool.allocate() else {
                drop(pool);
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("no free work item, dropping {:?}", operation);
                return Err(MailboxError::Exhausted);
            };
            let item = &mut pool.items[index];
            item.operation = operation;
            item.len = payload.len() as u8;
            item.payload = [0; WORK_ITEM_PAYLOAD_SIZE];
            item.payload[..payload.len()].copy_from_slice(&payload);
            index
        };

        // The FIFO holds as many entries as there are slots, so a
        // successful allocation always leaves room here.
        match self.tx.try_send(index as u8) {
            Ok(()) => {
                trace!("queued slot {} with op {:?}", index, operation);
                Ok(index)
            }
            Err(err) => {
                self.shared.lock().items[index].state = SlotState::Free;
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                match err {
                    TrySendError::Full(_) => Err(MailboxError::Exhausted),
                    TrySendError::Closed(_) => Err(MailboxError::Closed),
                }
            }
        }
    }

    /// Requests dropped so far because the mailbox was full or closed.
    pub fn dropped(&self) -> u32 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn in_use(&self) -> usize {
        self.shared.lock().in_use()
    }
}

/// The single consumer. Not cloneable.
#[derive(Debug)]
pub struct MailboxConsumer {
    shared: Arc<Shared>,
    rx: mpsc::Receiver<u8>,
}

impl MailboxConsumer {
    /// Takes the oldest queued item, if any, runs `handler` on it and
    /// frees its slot.
    ///
    /// The pool lock is held only while the slot is copied out and while
    /// it is released; the slot stays allocated for the duration of
    /// `handler`, so it cannot be reused underneath it.
    pub fn poll<R>(
        &mut self,
        handler: impl FnOnce(&Delivery) -> R,
    ) -> nb::Result<(Delivery, R), MailboxError> {
        let slot = match self.rx.try_recv() {
            Ok(slot) => usize::from(slot),
            Err(TryRecvError::Empty) => return Err(nb::Error::WouldBlock),
            Err(TryRecvError::Disconnected) => return Err(nb::Error::Other(MailboxError::Closed)),
        };

        let delivery = {
            let pool = self.shared.lock();
            let item = &pool.items[slot];
            Delivery {
                slot,
                operation: item.operation,
                len: usize::from(item.len),
                payload: item.payload,
            }
        };

        let result = handler(&delivery);

        self.shared.lock().items[slot].state = SlotState::Free;
        trace!("processed slot {} with op {:?}", slot, delivery.operation);
        Ok((delivery, result))
    }

    /// Dequeues one item without handling it.
    pub fn try_next(&mut self) -> nb::Result<Delivery, MailboxError> {
        self.poll(|_| ()).map(|(delivery, ())| delivery)
    }

    pub fn dropped(&self) -> u32 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn in_use(&self) -> usize {
        self.shared.lock().in_use()
    }
}
