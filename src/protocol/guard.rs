//! Guard connection
//!
//! Owns the single transport to the first-hop relay. Responsibilities:
//! run the initiator link handshake (VERSIONS, CERTS, AUTH_CHALLENGE,
//! NETINFO), then demultiplex incoming frames to registered circuits by
//! circuit id and serialize all outgoing writes through one path.
//!
//! The read loop lives in [`GuardReactor`], a future the caller spawns on
//! whatever executor it uses. Cells for one circuit are processed inline
//! in the reactor, so they reach the circuit strictly in arrival order.

use crate::error::{Result, TorError};
use crate::protocol::cell::{Cell, NetInfo, SUPPORTED_VERSIONS};
use crate::protocol::codec::{FrameBuffer, TorFrame};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// The encrypted, ordered byte stream to the guard relay. TLS setup and
/// relay certificate trust live in this collaborator, not here.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Receiver side of the dispatch table: one per registered circuit.
///
/// Both methods are called inline from the reactor and must not block or
/// suspend; per-circuit ordering is exactly reactor arrival order.
pub(crate) trait CellSink: Send + Sync {
    /// A cell addressed to this circuit id arrived.
    fn deliver(&self, cell: Cell);

    /// The guard connection died; fail every pending operation.
    fn connection_closed(&self, err: &TorError);
}

/// Link handshake progress, initiator side.
///
/// Cells must arrive exactly in this order; anything else is a protocol
/// violation that kills the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeState {
    WaitingForVersions,
    WaitingForCerts,
    WaitingForAuthChallenge,
    WaitingForNetInfo,
    Completed,
}

/// Pure state machine for the link handshake. The guard drives it with
/// decoded cells and performs the I/O it requests.
pub(crate) struct LinkHandshake {
    state: HandshakeState,
    versions: Option<Vec<u16>>,
    cert_count: usize,
}

impl LinkHandshake {
    pub(crate) fn new() -> Self {
        Self {
            state: HandshakeState::WaitingForVersions,
            versions: None,
            cert_count: 0,
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state == HandshakeState::Completed
    }

    /// Versions the peer offered, once received.
    pub(crate) fn peer_versions(&self) -> Option<&[u16]> {
        self.versions.as_deref()
    }

    /// Certificates the peer presented during the handshake.
    pub(crate) fn cert_count(&self) -> usize {
        self.cert_count
    }

    /// Advance with one received cell. Returns the NETINFO cell to send
    /// back when the handshake just completed.
    ///
    /// The peer's address claims are echoed without validation; that trust
    /// gap is inherited from the reference behavior and the address fields
    /// are not security-load-bearing here.
    pub(crate) fn advance(&mut self, cell: Cell) -> Result<Option<NetInfo>> {
        match (self.state, cell) {
            // Relays may pad at any point; padding carries no state.
            (_, Cell::Padding) => Ok(None),

            (HandshakeState::WaitingForVersions, Cell::Versions { versions }) => {
                log::debug!("Link handshake: peer versions {:?}", versions);
                self.versions = Some(versions);
                self.state = HandshakeState::WaitingForCerts;
                Ok(None)
            }
            (HandshakeState::WaitingForCerts, Cell::Certs { certs }) => {
                log::debug!("Link handshake: received {} certificates", certs.len());
                // Parsed and counted, not used for pinning.
                self.cert_count = certs.len();
                self.state = HandshakeState::WaitingForAuthChallenge;
                Ok(None)
            }
            (HandshakeState::WaitingForAuthChallenge, Cell::AuthChallenge { methods, .. }) => {
                log::debug!("Link handshake: auth challenge, methods {:?}", methods);
                self.state = HandshakeState::WaitingForNetInfo;
                Ok(None)
            }
            (HandshakeState::WaitingForNetInfo, Cell::NetInfo(netinfo)) => {
                let our_address = netinfo.other_address.clone();
                let their_address = netinfo.my_addresses.first().cloned().ok_or_else(|| {
                    TorError::Protocol("NETINFO carried no relay addresses".into())
                })?;
                self.state = HandshakeState::Completed;
                Ok(Some(NetInfo {
                    timestamp: unix_time_now(),
                    other_address: their_address,
                    my_addresses: vec![our_address],
                }))
            }
            (state, cell) => Err(TorError::Protocol(format!(
                "Unexpected cell {} in link handshake state {:?}",
                cell.command(),
                state
            ))),
        }
    }
}

fn unix_time_now() -> u32 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as u32,
        Err(_) => 0,
    }
}

struct GuardShared {
    writer: futures::lock::Mutex<WriteHalf<Box<dyn Transport>>>,
    circuits: Mutex<HashMap<u16, Weak<dyn CellSink>>>,
    closed: AtomicBool,
}

impl GuardShared {
    fn dispatch_frame(&self, frame: TorFrame) -> Result<()> {
        let cell = Cell::decode(frame.command, &frame.payload)?;

        if frame.circuit_id == 0 {
            // Connection-level traffic after the handshake: padding only.
            match cell {
                Cell::Padding => {}
                other => {
                    return Err(TorError::Protocol(format!(
                        "Unexpected connection-level cell: {}",
                        other.command()
                    )))
                }
            }
            return Ok(());
        }

        let sink = {
            let mut circuits = match self.circuits.lock() {
                Ok(map) => map,
                Err(_) => return Err(TorError::Internal("circuit map poisoned".into())),
            };
            let upgraded = circuits.get(&frame.circuit_id).map(|weak| weak.upgrade());
            match upgraded {
                Some(Some(sink)) => Some(sink),
                Some(None) => {
                    // Circuit object is gone; clean the stale entry.
                    circuits.remove(&frame.circuit_id);
                    None
                }
                None => None,
            }
        };

        match sink {
            Some(sink) => sink.deliver(cell),
            None => {
                // Benign race with teardown: a relay may still have cells
                // in flight for an id we already released.
                log::warn!(
                    "Orphan frame for circuit {} (command {}), dropping",
                    frame.circuit_id,
                    frame.command
                );
            }
        }
        Ok(())
    }

    fn fail_all_circuits(&self, err: &TorError) {
        let sinks: Vec<Weak<dyn CellSink>> = match self.circuits.lock() {
            Ok(mut circuits) => circuits.drain().map(|(_, sink)| sink).collect(),
            Err(_) => return,
        };
        for weak in sinks {
            if let Some(sink) = weak.upgrade() {
                sink.connection_closed(err);
            }
        }
    }
}

/// Handle to an established guard connection. Cheap to clone; all clones
/// share the same transport and dispatch table.
#[derive(Clone)]
pub struct TorGuard {
    shared: Arc<GuardShared>,
}

impl TorGuard {
    /// Run the link handshake over `transport` and return the guard handle
    /// together with its reactor. The reactor future must be spawned (or
    /// polled concurrently) by the caller; nothing is received until it
    /// runs. Completion of this call means NETINFO was exchanged.
    pub async fn connect<T: Transport + 'static>(transport: T) -> Result<(TorGuard, GuardReactor)> {
        let mut transport: Box<dyn Transport> = Box::new(transport);
        let mut buffer = FrameBuffer::new();

        send_cell_on(&mut transport, 0, &Cell::Versions {
            versions: SUPPORTED_VERSIONS.to_vec(),
        })
        .await?;

        let mut handshake = LinkHandshake::new();
        while !handshake.is_complete() {
            let frame = read_frame_on(&mut transport, &mut buffer).await?;
            if frame.circuit_id != 0 {
                return Err(TorError::Protocol(format!(
                    "Circuit frame (id {}) during link handshake",
                    frame.circuit_id
                )));
            }
            let cell = Cell::decode(frame.command, &frame.payload)?;
            if let Some(reply) = handshake.advance(cell)? {
                send_cell_on(&mut transport, 0, &Cell::NetInfo(reply)).await?;
            }
        }

        log::info!(
            "🤝 Link handshake complete (peer versions {:?}, {} certs)",
            handshake.peer_versions().unwrap_or(&[]),
            handshake.cert_count()
        );

        let (read_half, write_half) = transport.split();
        let shared = Arc::new(GuardShared {
            writer: futures::lock::Mutex::new(write_half),
            circuits: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let reactor = GuardReactor {
            read_half,
            buffer,
            shared: Arc::clone(&shared),
        };
        Ok((TorGuard { shared }, reactor))
    }

    /// Serialize and write one cell. The single write half behind an async
    /// mutex keeps concurrent senders from interleaving partial frames.
    pub async fn send(&self, circuit_id: u16, cell: Cell) -> Result<()> {
        if self.is_closed() {
            return Err(TorError::Transport("Guard connection is closed".into()));
        }
        let (command, payload) = cell.encode();
        let frame = TorFrame {
            circuit_id,
            command,
            payload,
        };
        let bytes = frame.encode();

        let mut writer = self.shared.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Close the transport and fail every circuit on this connection.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        {
            let mut writer = self.shared.writer.lock().await;
            let _ = writer.close().await;
        }
        self.shared
            .fail_all_circuits(&TorError::Transport("Guard connection closed locally".into()));
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Atomically claim `circuit_id` for `sink`. Returns false when the id
    /// is already taken. Registration happens before the first CREATE cell
    /// is sent so the response cannot race the registration.
    pub(crate) fn try_register(&self, circuit_id: u16, sink: Weak<dyn CellSink>) -> bool {
        let mut circuits = match self.shared.circuits.lock() {
            Ok(map) => map,
            Err(_) => return false,
        };
        match circuits.entry(circuit_id) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                // A dead weak entry no longer owns the id.
                if entry.get().upgrade().is_none() {
                    entry.insert(sink);
                    true
                } else {
                    false
                }
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(sink);
                true
            }
        }
    }

    /// Release a circuit id. Every teardown path ends here.
    pub(crate) fn deregister(&self, circuit_id: u16) {
        if let Ok(mut circuits) = self.shared.circuits.lock() {
            circuits.remove(&circuit_id);
        }
    }
}

async fn send_cell_on(transport: &mut Box<dyn Transport>, circuit_id: u16, cell: &Cell) -> Result<()> {
    let (command, payload) = cell.encode();
    let frame = TorFrame {
        circuit_id,
        command,
        payload,
    };
    transport.write_all(&frame.encode()).await?;
    transport.flush().await?;
    Ok(())
}

/// Read whole frames with an explicit accumulate loop; short reads just
/// go back to the transport for more bytes.
async fn read_frame_on(
    transport: &mut Box<dyn Transport>,
    buffer: &mut FrameBuffer,
) -> Result<TorFrame> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(frame) = buffer.next_frame() {
            return Ok(frame);
        }
        let n = transport.read(&mut chunk).await?;
        if n == 0 {
            return Err(TorError::Transport(
                "Connection closed during link handshake".into(),
            ));
        }
        buffer.extend(&chunk[..n]);
    }
}

/// The receive half of a guard connection.
///
/// `run` reads frames until the transport fails or closes, dispatching
/// each to its circuit. On exit every registered circuit is failed, so no
/// pending operation hangs silently.
pub struct GuardReactor {
    read_half: ReadHalf<Box<dyn Transport>>,
    buffer: FrameBuffer,
    shared: Arc<GuardShared>,
}

impl GuardReactor {
    pub async fn run(mut self) -> Result<()> {
        let result = self.read_loop().await;
        self.shared.closed.store(true, Ordering::SeqCst);

        let err = match &result {
            Ok(()) => TorError::Transport("Guard connection closed by peer".into()),
            Err(err) => err.clone(),
        };
        log::info!("Guard reactor stopping: {}", err);
        self.shared.fail_all_circuits(&err);
        result
    }

    async fn read_loop(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        loop {
            while let Some(frame) = self.buffer.next_frame() {
                log::trace!(
                    "Frame: circuit {} command {} ({} bytes)",
                    frame.circuit_id,
                    frame.command,
                    frame.payload.len()
                );
                self.shared.dispatch_frame(frame)?;
            }
            let n = self.read_half.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            self.buffer.extend(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cell::{Cert, RouterAddress};

    fn versions_cell() -> Cell {
        Cell::Versions { versions: vec![3, 4] }
    }

    fn certs_cell() -> Cell {
        Cell::Certs {
            certs: vec![Cert {
                cert_type: 2,
                certificate: vec![1, 2, 3],
            }],
        }
    }

    fn auth_challenge_cell() -> Cell {
        Cell::AuthChallenge {
            challenge: [9; 32],
            methods: vec![1],
        }
    }

    fn netinfo_cell() -> Cell {
        Cell::NetInfo(NetInfo {
            timestamp: 1_700_000_000,
            other_address: RouterAddress::from_ip("203.0.113.5".parse().unwrap()),
            my_addresses: vec![RouterAddress::from_ip("198.51.100.1".parse().unwrap())],
        })
    }

    #[test]
    fn handshake_accepts_cells_in_order() {
        let mut handshake = LinkHandshake::new();
        assert!(handshake.advance(versions_cell()).unwrap().is_none());
        assert!(handshake.advance(certs_cell()).unwrap().is_none());
        assert!(handshake.advance(auth_challenge_cell()).unwrap().is_none());

        let reply = handshake.advance(netinfo_cell()).unwrap().unwrap();
        assert!(handshake.is_complete());
        assert_eq!(handshake.peer_versions(), Some(&[3u16, 4][..]));

        // Their claimed address becomes our other_address; our address as
        // they saw it becomes our claimed address.
        assert_eq!(
            reply.other_address,
            RouterAddress::from_ip("198.51.100.1".parse().unwrap())
        );
        assert_eq!(
            reply.my_addresses,
            vec![RouterAddress::from_ip("203.0.113.5".parse().unwrap())]
        );
    }

    #[test]
    fn handshake_rejects_out_of_order_cells() {
        let mut handshake = LinkHandshake::new();
        match handshake.advance(certs_cell()) {
            Err(TorError::Protocol(_)) => {}
            other => panic!("expected protocol error, got {other:?}"),
        }

        let mut handshake = LinkHandshake::new();
        handshake.advance(versions_cell()).unwrap();
        assert!(handshake.advance(netinfo_cell()).is_err());
    }

    #[test]
    fn handshake_ignores_padding() {
        let mut handshake = LinkHandshake::new();
        assert!(handshake.advance(Cell::Padding).unwrap().is_none());
        assert!(handshake.advance(versions_cell()).unwrap().is_none());
        assert!(handshake.advance(Cell::Padding).unwrap().is_none());
        assert!(handshake.advance(certs_cell()).unwrap().is_none());
    }

    #[test]
    fn handshake_requires_relay_address() {
        let mut handshake = LinkHandshake::new();
        handshake.advance(versions_cell()).unwrap();
        handshake.advance(certs_cell()).unwrap();
        handshake.advance(auth_challenge_cell()).unwrap();

        let empty = Cell::NetInfo(NetInfo {
            timestamp: 0,
            other_address: RouterAddress::from_ip("203.0.113.5".parse().unwrap()),
            my_addresses: vec![],
        });
        assert!(handshake.advance(empty).is_err());
    }
}
