//! Circuits
//!
//! A circuit is a virtual path of 1..N hops multiplexed onto one guard
//! connection. This module owns the hop-by-hop key agreement
//! (CREATE_FAST/CREATE2, EXTEND2), the layered relay-cell transforms and
//! the stream registry.
//!
//! All incoming cells for a circuit arrive through [`CellSink::deliver`],
//! called inline by the guard reactor, so the digest and cipher state
//! advance strictly in wire order. Outgoing relay cells take a circuit
//! send lock across digest-and-encrypt plus the transport write for the
//! same reason.

use crate::crypto::TorCryptoState;
use crate::error::{Result, TorError};
use crate::protocol::cell::{Cell, HANDSHAKE_TYPE_NTOR};
use crate::protocol::codec::FIXED_PAYLOAD_LEN;
use crate::protocol::guard::{CellSink, TorGuard};
use crate::protocol::handshake::{FastKeyAgreement, KeyAgreement, NtorKeyAgreement};
use crate::protocol::node::CircuitNodeDetail;
use crate::protocol::relay::{RelayCellPlain, RelayCommand};
use crate::protocol::stream::StreamEvent;
use futures::channel::{mpsc, oneshot};
use rand::RngCore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use subtle::ConstantTimeEq;

/// Retry budget for random id allocation, mirroring the reference
/// client's ceiling of 64 draws before giving up.
pub const MAX_ID_GENERATION_RETRY: usize = 64;

/// Circuit-level SENDME increment: one SENDME per this many delivered
/// DATA cells.
pub const CIRCUIT_SENDME_INCREMENT: u32 = 100;

/// DESTROY reason sent on clean local teardown.
const DESTROY_REASON_NONE: u8 = 0;

/// Draw random non-zero 16-bit ids until `try_claim` accepts one, within
/// the retry budget. Used for both circuit and stream ids; the rng is
/// injected so exhaustion is deterministically testable.
pub(crate) fn allocate_nonzero_id(
    rng: &mut dyn RngCore,
    mut try_claim: impl FnMut(u16) -> bool,
) -> Option<u16> {
    for _ in 0..MAX_ID_GENERATION_RETRY {
        let id = (rng.next_u32() & 0xffff) as u16;
        if id == 0 {
            continue;
        }
        if try_claim(id) {
            return Some(id);
        }
    }
    None
}

enum CircuitState {
    /// Registered but nothing sent yet
    Initialized,
    /// CREATE sent, awaiting CREATED
    CreatePending {
        agreement: Box<dyn KeyAgreement>,
        done: Option<oneshot::Sender<Result<()>>>,
    },
    /// EXTEND sent through existing hops, awaiting EXTENDED
    ExtendPending {
        agreement: Box<dyn KeyAgreement>,
        done: Option<oneshot::Sender<Result<()>>>,
    },
    /// At least one hop established and no extension in flight
    Ready,
    Destroyed,
}

impl CircuitState {
    fn name(&self) -> &'static str {
        match self {
            CircuitState::Initialized => "initialized",
            CircuitState::CreatePending { .. } => "create-pending",
            CircuitState::ExtendPending { .. } => "extend-pending",
            CircuitState::Ready => "ready",
            CircuitState::Destroyed => "destroyed",
        }
    }
}

struct StreamEntry {
    events: mpsc::UnboundedSender<StreamEvent>,
}

struct CircuitInner {
    state: CircuitState,
    /// Hop 0 is the guard, the last entry the terminal hop
    hops: Vec<TorCryptoState>,
    streams: HashMap<u16, StreamEntry>,
    /// DATA cells delivered since the last circuit-level SENDME
    delivered_since_sendme: u32,
    /// Relay cells we may still send before the peer must SENDME
    package_window: i32,
}

pub(crate) struct CircuitShared {
    id: AtomicU16,
    guard: TorGuard,
    inner: Mutex<CircuitInner>,
    /// Serializes digest-and-encrypt with the transport write so the
    /// running forward digests match wire order under concurrent senders
    send_lock: futures::lock::Mutex<()>,
}

impl CircuitShared {
    fn lock_inner(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn id(&self) -> u16 {
        self.id.load(Ordering::SeqCst)
    }

    /// Fulfil a pending-operation completion exactly once. A missing
    /// sender means the state machine fulfilled it twice, which is a bug,
    /// not a tolerable race.
    fn fulfil(done: &mut Option<oneshot::Sender<Result<()>>>, result: Result<()>) {
        match done.take() {
            Some(sender) => {
                // The waiter may have been dropped (cancelled); that is fine.
                let _ = sender.send(result);
            }
            None => {
                debug_assert!(false, "completion fulfilled twice");
                log::error!("Circuit completion fulfilled twice; dropping result");
            }
        }
    }

    /// Tear the circuit down: deregister the id, fail the pending
    /// operation and every stream. Every teardown path funnels through
    /// here.
    fn destroy_with(&self, inner: &mut CircuitInner, err: TorError) {
        if matches!(inner.state, CircuitState::Destroyed) {
            return;
        }
        log::info!("Circuit {} destroyed: {}", self.id(), err);
        let old_state = std::mem::replace(&mut inner.state, CircuitState::Destroyed);
        match old_state {
            CircuitState::CreatePending { mut done, .. }
            | CircuitState::ExtendPending { mut done, .. } => {
                Self::fulfil(&mut done, Err(err.clone()));
            }
            _ => {}
        }
        // Streams always see circuit teardown as CircuitClosed, with the
        // underlying cause carried in the message.
        let stream_err = match &err {
            TorError::CircuitClosed(_) => err.clone(),
            other => TorError::CircuitClosed(other.to_string()),
        };
        for (_, entry) in inner.streams.drain() {
            let _ = entry
                .events
                .unbounded_send(StreamEvent::Closed(stream_err.clone()));
        }
        inner.hops.clear();
        self.guard.deregister(self.id());
    }

    fn handle_created(&self, server_response: &[u8]) {
        let mut inner = self.lock_inner();
        match std::mem::replace(&mut inner.state, CircuitState::Ready) {
            CircuitState::CreatePending {
                agreement,
                mut done,
            } => match agreement
                .derive_keys(server_response)
                .and_then(|kdf| TorCryptoState::from_kdf_result(&kdf))
            {
                Ok(state) => {
                    inner.hops.push(state);
                    log::info!("🔗 Circuit {} created (1 hop)", self.id());
                    Self::fulfil(&mut done, Ok(()));
                }
                Err(err) => {
                    // State already reads Ready here, so the teardown path
                    // cannot see (and re-fulfil) the taken sender.
                    Self::fulfil(&mut done, Err(err.clone()));
                    self.destroy_with(&mut inner, err);
                }
            },
            other => {
                log::warn!(
                    "Circuit {}: CREATED cell in state {}, dropping",
                    self.id(),
                    other.name()
                );
                inner.state = other;
            }
        }
    }

    fn handle_extended(&self, inner: &mut CircuitInner, handshake_data: &[u8]) {
        match std::mem::replace(&mut inner.state, CircuitState::Ready) {
            CircuitState::ExtendPending {
                agreement,
                mut done,
            } => match agreement
                .derive_keys(handshake_data)
                .and_then(|kdf| TorCryptoState::from_kdf_result(&kdf))
            {
                Ok(state) => {
                    inner.hops.push(state);
                    log::info!(
                        "🔗 Circuit {} extended ({} hops)",
                        self.id(),
                        inner.hops.len()
                    );
                    Self::fulfil(&mut done, Ok(()));
                }
                Err(err) => {
                    Self::fulfil(&mut done, Err(err.clone()));
                    self.destroy_with(inner, err);
                }
            },
            other => {
                log::warn!(
                    "Circuit {}: EXTENDED cell in state {}, dropping",
                    self.id(),
                    other.name()
                );
                inner.state = other;
            }
        }
    }

    /// Peel backward-cipher layers until some hop recognizes the cell,
    /// verify its digest there, then dispatch the plaintext.
    fn handle_relay(&self, mut body: Vec<u8>) {
        let mut inner = self.lock_inner();
        if matches!(inner.state, CircuitState::Destroyed) {
            return;
        }
        if body.len() != FIXED_PAYLOAD_LEN {
            self.destroy_with(
                &mut inner,
                TorError::Integrity("Relay cell with wrong payload size".into()),
            );
            return;
        }

        let mut origin_hop = None;
        for (hop_index, hop) in inner.hops.iter_mut().enumerate() {
            hop.backward_cipher.apply(&mut body);

            // recognized == 0 is a cheap filter; the digest decides.
            if body[1] != 0 || body[2] != 0 {
                continue;
            }
            let mut claimed_digest = [0u8; 4];
            claimed_digest.copy_from_slice(&body[5..9]);

            let mut zeroed = body.clone();
            zeroed[5..9].fill(0);
            let peeked = hop.backward_digest.peek_digest(&zeroed);
            if bool::from(peeked[..4].ct_eq(&claimed_digest)) {
                // Commit only after acceptance, with the digest field zeroed.
                hop.backward_digest.update(&zeroed);
                origin_hop = Some(hop_index);
                break;
            }
        }

        let Some(origin_hop) = origin_hop else {
            // A cell must be recognized by exactly one hop; a cell no hop
            // accepts poisons the circuit's crypto state.
            self.destroy_with(
                &mut inner,
                TorError::Integrity("Relay cell not recognized by any hop".into()),
            );
            return;
        };

        let plain = match RelayCellPlain::decode(&body) {
            Ok(plain) => plain,
            Err(err) => {
                self.destroy_with(
                    &mut inner,
                    TorError::Integrity(format!("Recognized relay cell unparsable: {}", err)),
                );
                return;
            }
        };

        log::trace!(
            "Circuit {}: relay {:?} from hop {} (stream {}, {} bytes)",
            self.id(),
            plain.command,
            origin_hop,
            plain.stream_id,
            plain.data.len()
        );

        if plain.stream_id == 0 {
            self.handle_control_relay(&mut inner, plain);
        } else {
            self.dispatch_to_stream(&mut inner, plain);
        }
    }

    fn handle_control_relay(&self, inner: &mut CircuitInner, plain: RelayCellPlain) {
        match plain.command {
            RelayCommand::Extended2 => {
                // EXTENDED2 data: HLEN (2 bytes) then HDATA.
                if plain.data.len() < 2 {
                    self.destroy_with(
                        inner,
                        TorError::Protocol("EXTENDED2 reply too short".into()),
                    );
                    return;
                }
                let hlen = u16::from_be_bytes([plain.data[0], plain.data[1]]) as usize;
                if plain.data.len() < 2 + hlen {
                    self.destroy_with(
                        inner,
                        TorError::Protocol("EXTENDED2 handshake data truncated".into()),
                    );
                    return;
                }
                let handshake_data = plain.data[2..2 + hlen].to_vec();
                self.handle_extended(inner, &handshake_data);
            }
            RelayCommand::Truncated => {
                let reason = plain.data.first().copied().unwrap_or(0);
                self.destroy_with(
                    inner,
                    TorError::CircuitClosed(format!("Circuit truncated (reason {})", reason)),
                );
            }
            RelayCommand::Sendme => {
                inner.package_window += CIRCUIT_SENDME_INCREMENT as i32;
                log::debug!(
                    "Circuit {}: SENDME, package window now {}",
                    self.id(),
                    inner.package_window
                );
            }
            RelayCommand::Drop => {}
            other => {
                log::warn!(
                    "Circuit {}: unexpected control relay command {:?}, dropping",
                    self.id(),
                    other
                );
            }
        }
    }

    fn dispatch_to_stream(&self, inner: &mut CircuitInner, plain: RelayCellPlain) {
        let stream_id = plain.stream_id;
        let Some(entry) = inner.streams.get(&stream_id) else {
            // Same benign race as orphan circuit frames: END and teardown
            // can cross in flight.
            log::warn!(
                "Circuit {}: relay cell for unknown stream {}, dropping",
                self.id(),
                stream_id
            );
            return;
        };

        let event = match plain.command {
            RelayCommand::Connected => StreamEvent::Connected,
            RelayCommand::Data => {
                inner.delivered_since_sendme += 1;
                StreamEvent::Data(plain.data)
            }
            RelayCommand::Sendme => StreamEvent::Sendme,
            RelayCommand::End => {
                let reason = plain.data.first().copied().unwrap_or(0);
                StreamEvent::End(reason)
            }
            other => {
                log::warn!(
                    "Circuit {}: unexpected stream relay command {:?}, dropping",
                    self.id(),
                    other
                );
                return;
            }
        };

        let ended = matches!(event, StreamEvent::End(_));
        if entry.events.unbounded_send(event).is_err() {
            // Receiver dropped without closing; forget the stream.
            inner.streams.remove(&stream_id);
            return;
        }
        if ended {
            inner.streams.remove(&stream_id);
        }
    }

    /// Digest, onion-encrypt and send one relay cell. The digest always
    /// belongs to the terminal hop, the cell's destination.
    pub(crate) async fn send_relay(&self, mut cell: RelayCellPlain, early: bool) -> Result<()> {
        let _send_guard = self.send_lock.lock().await;

        let encrypted = {
            let mut inner = self.lock_inner();
            match inner.state {
                CircuitState::Ready | CircuitState::ExtendPending { .. } => {}
                CircuitState::Destroyed => {
                    return Err(TorError::CircuitClosed(
                        "Relay send on destroyed circuit".into(),
                    ))
                }
                _ => {
                    return Err(TorError::Internal(format!(
                        "Relay send in state {}",
                        inner.state.name()
                    )))
                }
            }
            if inner.hops.is_empty() {
                return Err(TorError::Internal("Relay send with no hops".into()));
            }

            let destination = inner.hops.len() - 1;
            let zeroed = cell.encode(true);
            inner.hops[destination].forward_digest.update(&zeroed);
            let digest = inner.hops[destination].forward_digest.current_digest();
            cell.digest.copy_from_slice(&digest[..4]);

            let mut body = cell.encode(false);
            // Outermost layer last: the guard peels first.
            for hop in inner.hops.iter_mut().rev() {
                hop.forward_cipher.apply(&mut body);
            }
            inner.package_window -= 1;
            body
        };

        let cell = if early {
            Cell::RelayEarly { encrypted }
        } else {
            Cell::Relay { encrypted }
        };
        self.guard.send(self.id(), cell).await
    }

    /// Register a stream inbox under a fresh random id.
    pub(crate) fn register_stream(
        &self,
    ) -> Result<(u16, mpsc::UnboundedReceiver<StreamEvent>)> {
        let mut inner = self.lock_inner();
        match inner.state {
            CircuitState::Ready => {}
            CircuitState::Destroyed => {
                return Err(TorError::CircuitClosed("Stream open on destroyed circuit".into()))
            }
            _ => {
                return Err(TorError::Internal(format!(
                    "Stream open in state {}",
                    inner.state.name()
                )))
            }
        }

        let (sender, receiver) = mpsc::unbounded();
        let streams = &mut inner.streams;
        let mut rng = rand::thread_rng();
        let id = allocate_nonzero_id(&mut rng, |candidate| {
            if streams.contains_key(&candidate) {
                false
            } else {
                streams.insert(
                    candidate,
                    StreamEntry {
                        events: sender.clone(),
                    },
                );
                true
            }
        })
        .ok_or(TorError::StreamIdExhausted)?;
        Ok((id, receiver))
    }

    pub(crate) fn remove_stream(&self, stream_id: u16) {
        self.lock_inner().streams.remove(&stream_id);
    }

    /// Delivery-side circuit flow accounting. True when a circuit-level
    /// SENDME is due.
    pub(crate) fn take_circuit_sendme_due(&self) -> bool {
        let mut inner = self.lock_inner();
        if inner.delivered_since_sendme >= CIRCUIT_SENDME_INCREMENT {
            inner.delivered_since_sendme -= CIRCUIT_SENDME_INCREMENT;
            true
        } else {
            false
        }
    }

    fn hop_count_now(&self) -> usize {
        self.lock_inner().hops.len()
    }
}

impl CellSink for CircuitShared {
    fn deliver(&self, cell: Cell) {
        match cell {
            Cell::CreatedFast {
                y,
                derivative_key_data,
            } => {
                let mut response = Vec::with_capacity(40);
                response.extend_from_slice(&y);
                response.extend_from_slice(&derivative_key_data);
                self.handle_created(&response);
            }
            Cell::Created2 { handshake_data } => self.handle_created(&handshake_data),
            Cell::Relay { encrypted } | Cell::RelayEarly { encrypted } => {
                self.handle_relay(encrypted)
            }
            Cell::Destroy { reason } => {
                let mut inner = self.lock_inner();
                self.destroy_with(
                    &mut inner,
                    TorError::CircuitClosed(format!("DESTROY received (reason {})", reason)),
                );
            }
            Cell::Padding => {}
            other => {
                log::warn!(
                    "Circuit {}: unexpected cell command {}, dropping",
                    self.id(),
                    other.command()
                );
            }
        }
    }

    fn connection_closed(&self, err: &TorError) {
        let mut inner = self.lock_inner();
        self.destroy_with(
            &mut inner,
            TorError::CircuitClosed(format!("Guard connection lost: {}", err)),
        );
    }
}

/// A virtual multi-hop path over one guard connection.
pub struct TorCircuit {
    pub(crate) shared: Arc<CircuitShared>,
}

impl std::fmt::Debug for TorCircuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorCircuit")
            .field("id", &self.shared.id.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl TorCircuit {
    /// Build a 1-hop circuit with the CREATE_FAST handshake.
    pub async fn create_fast(guard: &TorGuard) -> Result<TorCircuit> {
        let agreement = FastKeyAgreement::new();
        let material = agreement.client_material();
        let mut x = [0u8; 20];
        x.copy_from_slice(&material);
        Self::create_with(guard, Box::new(agreement), Cell::CreateFast { x }).await
    }

    /// Build a 1-hop circuit with the ntor handshake (CREATE2).
    pub async fn create(guard: &TorGuard, node: &CircuitNodeDetail) -> Result<TorCircuit> {
        let agreement = NtorKeyAgreement::new(node);
        let handshake_data = agreement.client_material();
        let cell = Cell::Create2 {
            handshake_type: HANDSHAKE_TYPE_NTOR,
            handshake_data,
        };
        Self::create_with(guard, Box::new(agreement), cell).await
    }

    async fn create_with(
        guard: &TorGuard,
        agreement: Box<dyn KeyAgreement>,
        create_cell: Cell,
    ) -> Result<TorCircuit> {
        let shared = Arc::new(CircuitShared {
            id: AtomicU16::new(0),
            guard: guard.clone(),
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Initialized,
                hops: Vec::new(),
                streams: HashMap::new(),
                delivered_since_sendme: 0,
                package_window: 1000,
            }),
            send_lock: futures::lock::Mutex::new(()),
        });

        // Register before the CREATE cell goes out, or the CREATED reply
        // could race the registration.
        let sink: Arc<dyn CellSink> = shared.clone();
        let weak = Arc::downgrade(&sink);
        let mut rng = rand::thread_rng();
        let id = allocate_nonzero_id(&mut rng, |candidate| {
            guard.try_register(candidate, weak.clone())
        })
        .ok_or(TorError::CircuitIdExhausted)?;
        shared.id.store(id, Ordering::SeqCst);

        let receiver = {
            let mut inner = shared.lock_inner();
            let (sender, receiver) = oneshot::channel();
            inner.state = CircuitState::CreatePending {
                agreement,
                done: Some(sender),
            };
            receiver
        };

        log::debug!("Circuit {}: sending {}", id, create_cell.command());
        if let Err(err) = guard.send(id, create_cell).await {
            let mut inner = shared.lock_inner();
            shared.destroy_with(&mut inner, err.clone());
            return Err(err);
        }

        match receiver.await {
            Ok(Ok(())) => Ok(TorCircuit { shared }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TorError::CircuitClosed(
                "Connection closed while creating circuit".into(),
            )),
        }
    }

    /// Extend the circuit by one hop with EXTEND2 through the existing
    /// hops. Only IPv4 link specifiers are emitted.
    pub async fn extend(&self, node: &CircuitNodeDetail) -> Result<()> {
        let agreement = NtorKeyAgreement::new(node);
        let payload = extend2_payload(node, &agreement.client_material())?;

        let receiver = {
            let mut inner = self.shared.lock_inner();
            match inner.state {
                CircuitState::Ready => {}
                CircuitState::Destroyed => {
                    return Err(TorError::CircuitClosed("Extend on destroyed circuit".into()))
                }
                _ => {
                    return Err(TorError::Internal(format!(
                        "Extend in state {}",
                        inner.state.name()
                    )))
                }
            }
            let (sender, receiver) = oneshot::channel();
            inner.state = CircuitState::ExtendPending {
                agreement: Box::new(agreement),
                done: Some(sender),
            };
            receiver
        };

        let relay_cell = RelayCellPlain::new(RelayCommand::Extend2, 0, payload)?;
        // Circuit extensions must ride RELAY_EARLY.
        if let Err(err) = self.shared.send_relay(relay_cell, true).await {
            let mut inner = self.shared.lock_inner();
            self.shared.destroy_with(&mut inner, err.clone());
            return Err(err);
        }

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(TorError::CircuitClosed(
                "Connection closed while extending circuit".into(),
            )),
        }
    }

    /// Tear the circuit down locally and tell the guard relay.
    pub async fn destroy(&self) -> Result<()> {
        let id = self.shared.id();
        {
            let mut inner = self.shared.lock_inner();
            if matches!(inner.state, CircuitState::Destroyed) {
                return Ok(());
            }
            self.shared.destroy_with(
                &mut inner,
                TorError::CircuitClosed("Destroyed locally".into()),
            );
        }
        self.shared
            .guard
            .send(id, Cell::Destroy {
                reason: DESTROY_REASON_NONE,
            })
            .await
    }

    pub fn id(&self) -> u16 {
        self.shared.id()
    }

    pub fn hop_count(&self) -> usize {
        self.shared.hop_count_now()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.shared.lock_inner().state, CircuitState::Ready)
    }
}

/// EXTEND2 relay payload: link specifier list, handshake type and client
/// key material.
fn extend2_payload(node: &CircuitNodeDetail, client_material: &[u8]) -> Result<Vec<u8>> {
    let SocketAddr::V4(addr) = node.endpoint else {
        return Err(TorError::Internal(
            "Only IPv4 link specifiers are supported for EXTEND2".into(),
        ));
    };

    let mut payload = Vec::with_capacity(2 + 8 + 22 + 4 + client_material.len());
    payload.push(2); // two link specifiers

    // TLS-over-IPv4: type 0, 6 bytes.
    payload.push(0);
    payload.push(6);
    payload.extend_from_slice(&addr.ip().octets());
    payload.extend_from_slice(&addr.port().to_be_bytes());

    // Legacy RSA identity: type 2, 20 bytes.
    payload.push(2);
    payload.push(20);
    payload.extend_from_slice(&node.identity_fingerprint);

    payload.extend_from_slice(&HANDSHAKE_TYPE_NTOR.to_be_bytes());
    payload.extend_from_slice(&(client_material.len() as u16).to_be_bytes());
    payload.extend_from_slice(client_material);
    Ok(payload)
}
