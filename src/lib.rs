//! # BTS signalling control plane
//!
//! Drives the signalling link between a GSM base station's radio peer and
//! the switching side: mobility management, call control, point to point
//! SMS and USSD, all exchanged as structured layer 3 PDUs over a datagram
//! socket.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bts_signal::{BtsConfig, Capabilities, Engine, JsonCodec, LoggingCollaborator};
//! use bts_signal::clock::SystemClock;
//! use bts_signal::transport::MemoryTransport;
//! use bts_signal::workers::WorkerPool;
//! use std::sync::Arc;
//!
//! let engine = Engine::new(
//!     BtsConfig::default(),
//!     Capabilities {
//!         transport: Arc::new(MemoryTransport::new()),
//!         codec: Arc::new(JsonCodec::new()),
//!         collaborator: Arc::new(LoggingCollaborator),
//!         clock: Arc::new(SystemClock),
//!         workers: WorkerPool::inline(),
//!     },
//! );
//! engine.start();
//! engine.tick();
//! ```
//!
//! ## Architecture
//!
//! - [`engine`] - Context object owning every subsystem
//! - [`signalling`] - Session state, heartbeats and frame I/O
//! - [`connection`] - Per radio connection state and idle policy
//! - [`mm`] - Location updating, identity and paging
//! - [`cc`] - Call control and call channels
//! - [`sms`] - CP/RP short message relay
//! - [`ussd`] - Supplementary service sessions
//! - [`supervisor`] - Start and restart bookkeeping

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod cc;
pub mod clock;
pub mod codec;
pub mod collaborator;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod message;
pub mod mm;
pub mod pdu;
pub mod rp;
pub mod signalling;
pub mod sms;
pub mod supervisor;
pub mod tid;
pub mod transport;
pub mod ue;
pub mod ussd;
pub mod workers;

// Re-export main public types for convenience
pub use codec::{JsonCodec, L3Codec};
pub use collaborator::{Collaborator, Event, LoggingCollaborator};
pub use config::{BtsConfig, LaiConfig};
pub use engine::{Capabilities, Engine, EngineStats};
pub use error::{BtsError, Result};
pub use message::{Message, Primitive};
pub use pdu::Pdu;
pub use sms::{MtSmsOutcome, MtSmsTicket};
pub use supervisor::DriverState;

use static_assertions::{assert_impl_all, const_assert_eq};

assert_impl_all!(Engine: Send, Sync);
assert_impl_all!(connection::Connection: Send, Sync);
const_assert_eq!(cc::MAX_CALLS, 7);
