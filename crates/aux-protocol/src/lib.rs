//! AUX air-conditioner serial protocol
//!
//! This crate implements the half-duplex serial protocol spoken by AUX-based
//! split air-conditioner units: framing and checksums, status decoding,
//! command encoding, the link state machine and the request/confirm sequence
//! engine that drives it.

pub mod codec;
pub mod commands;
pub mod config;
pub mod frame;
pub mod link;
pub mod sequence;
pub mod transport;
pub mod types;

#[cfg(test)]
mod mock;

pub use commands::{InfoCode, PacketType};
pub use config::LinkConfig;
pub use frame::{Frame, FrameBuffer, Header};
pub use link::{ByteStream, Clock, Link, LinkState, LinkStats, SystemClock};
pub use sequence::{Sequence, StepOutcome};
pub use transport::{AcEvent, AuxTransport, ParityMode, SerialConfig, SerialStream, Snapshot};
pub use types::*;
