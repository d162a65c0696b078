//! Tor link and circuit protocol
//!
//! The layers, bottom up:
//! - `codec`: big-endian cursor helpers and the frame codec
//! - `cell`: typed cells over the command set
//! - `relay`: relay-cell plaintext with the digest field conventions
//! - `handshake` / `ntor`: circuit key agreement
//! - `guard`: link handshake, dispatch and the read reactor
//! - `circuit`: hop management and onion-layer transforms
//! - `stream`: byte streams multiplexed inside a circuit

pub mod cell;
pub mod circuit;
pub mod codec;
pub mod guard;
pub mod handshake;
pub mod node;
pub mod ntor;
pub mod relay;
pub mod stream;

pub use cell::{Cell, Cert, NetInfo, RouterAddress, SUPPORTED_VERSIONS};
pub use circuit::{TorCircuit, CIRCUIT_SENDME_INCREMENT, MAX_ID_GENERATION_RETRY};
pub use codec::{FrameBuffer, TorFrame, FIXED_PAYLOAD_LEN};
pub use guard::{GuardReactor, TorGuard, Transport};
pub use handshake::{FastKeyAgreement, KeyAgreement, NtorKeyAgreement};
pub use node::CircuitNodeDetail;
pub use ntor::NtorClient;
pub use relay::{RelayCellPlain, RelayCommand, MAX_RELAY_DATA_LEN, RELAY_HEADER_LEN};
pub use stream::{TorStream, STREAM_INITIAL_WINDOW, STREAM_SENDME_INCREMENT};
