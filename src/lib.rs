#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(unreachable_pub)]
#![deny(clippy::correctness)]
#![deny(clippy::suspicious)]
#![deny(clippy::style)]
#![deny(clippy::complexity)]
#![deny(clippy::perf)]
#![deny(clippy::pedantic)]
#![deny(clippy::std_instead_of_core)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

//! TCP stream reassembly for network inspection.
//!
//! Captured segments are tracked per flow by a [`stream::SessionState`], which
//! follows the connection's phases and rebuilds each direction's byte stream
//! according to a target-stack overlap policy. Reassembled data goes to a
//! [`stream::StreamInspector`]; anomalies and evasion attempts go to a
//! [`stream::EventSink`].

pub mod config;
pub mod error;
pub mod ha;
pub mod packet;
pub mod replay;
pub mod stream;

pub use config::StreamConfig;
pub use error::{Error, Result};
