//! # Spot Relay
//!
//! Core of a small network-attached receiver that relays amateur-radio
//! decode reports ("spots") to a remote aggregation service, and bridges
//! requests arriving over a peripheral bus into its main loop.
//!
//! ## Features
//!
//! - **Report encoding**: IPFIX-style datagrams with template descriptors,
//!   a reporter-identity record and a batch of up to 40 received spots
//! - **Bounded mailbox**: 20 fixed 32-byte work items handed from the bus
//!   callback to the main loop without ever blocking the producer
//! - **Copy-on-write strings**: shared byte buffers that detach on write
//! - **Embedded-friendly**: fixed capacities, bounds-checked encoding
//!
//! ## Quick Start
//!
//! ```rust
//! use spotrelay::{
//!     bus, ManualClock, Operation, RecordingTransport, RelayAgent, RelayConfig,
//!     ReportAggregator,
//! };
//!
//! let config = RelayConfig::default();
//! let transport = RecordingTransport::new();
//! let reporter =
//!     ReportAggregator::from_config(&config, 0, transport.clone(), ManualClock::new(1_700_000_000));
//! let mut agent = RelayAgent::new(config, reporter);
//!
//! // the bus callback side
//! let bridge = agent.bridge();
//! let spot = bus::received_payload("K1ABC", 14_074_000, -12).unwrap();
//! let mut transaction = vec![Operation::ReceivedRecord as u8];
//! transaction.extend_from_slice(&spot);
//! bridge.on_receive(&transaction);
//! bridge.on_receive(&[Operation::SendRequest as u8]);
//!
//! // the main loop side
//! agent.tick(1);
//! agent.tick(2);
//! assert_eq!(transport.sent().len(), 1);
//! ```
//!
//! ## Architecture
//!
//! - [`agent`] - Main loop: periodic work and mailbox dispatch
//! - [`bus`] - Peripheral-bus callbacks and transaction payloads
//! - [`mailbox`] - Bounded producer/consumer work queue
//! - [`reporter`] - Spot aggregation and datagram assembly
//! - [`record`], [`template`], [`wire`] - Wire encoding
//! - [`buffer`] - Copy-on-write byte buffer
//! - [`clock`], [`transport`], [`config`] - Collaborators and settings

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]

pub mod agent;
pub mod buffer;
pub mod bus;
pub mod clock;
pub mod config;
pub mod mailbox;
pub mod record;
pub mod reporter;
pub mod template;
pub mod transport;
pub mod wire;

// Re-export main public types for convenience
pub use agent::{Dispatch, Outcome, RelayAgent, RelayStats};
pub use buffer::SharedBytes;
pub use bus::{BusBridge, BusFrame};
pub use clock::{Clock, ManualClock, RtcTime, SystemClock, TimeOfDay};
pub use config::RelayConfig;
pub use mailbox::{Mailbox, MailboxConsumer, MailboxProducer, Operation};
pub use record::{ReceivedRecord, ReporterIdentity};
pub use reporter::{ReportAggregator, ReportError, SendReport};
pub use transport::{Endpoint, LinkState, RecordingTransport, Transport, UdpTransport};
