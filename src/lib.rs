//! # tor-circuit
//!
//! Client-side engine for the Tor onion-routing protocol: cell framing,
//! per-hop circuit cryptography and circuit/stream multiplexing over a
//! single guard connection.
//!
//! ## Architecture
//!
//! ```text
//! TorStream            (BEGIN / DATA / END)
//!   ↓
//! TorCircuit           (CREATE / EXTEND, onion layers, running digests)
//!   ↓
//! TorGuard + reactor   (link handshake, frame dispatch by circuit id)
//!   ↓
//! Transport            (TLS stream supplied by the caller)
//! ```
//!
//! The crate is runtime-agnostic: `TorGuard::connect` returns a
//! [`protocol::GuardReactor`] future which the caller spawns on its own
//! executor. TLS setup, directory documents and proxy front-ends are the
//! caller's business; this crate starts at the byte stream to the guard
//! relay and ends at circuit streams.

pub mod crypto;
pub mod error;
pub mod protocol;

pub use error::{Result, TorError};
pub use protocol::{
    Cell, CircuitNodeDetail, FrameBuffer, GuardReactor, RelayCellPlain, RelayCommand, TorCircuit,
    TorFrame, TorGuard, TorStream, Transport,
};
