//! Streams
//!
//! A stream is a logical byte channel multiplexed inside a circuit,
//! opened with BEGIN or BEGIN_DIR and carried in DATA relay cells. The
//! circuit's receive path pushes events into a per-stream inbox; this
//! module consumes them in arrival order and runs the delivery-side
//! SENDME accounting (500/50 stream windows, 1000/100 circuit windows).

use crate::error::{Result, TorError};
use crate::protocol::circuit::{CircuitShared, TorCircuit};
use crate::protocol::relay::{RelayCellPlain, END_REASON_DONE, MAX_RELAY_DATA_LEN};
use futures::channel::mpsc;
use futures::StreamExt;
use std::sync::Arc;

/// Stream-level SENDME increment: one SENDME per this many delivered
/// DATA cells.
pub const STREAM_SENDME_INCREMENT: u32 = 50;

/// Initial stream-level package window.
pub const STREAM_INITIAL_WINDOW: i32 = 500;

/// What the circuit receive path delivers to a stream inbox.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// BEGIN/BEGIN_DIR was answered; the stream is usable
    Connected,
    /// One DATA cell's payload
    Data(Vec<u8>),
    /// Stream-level SENDME from the far end
    Sendme,
    /// RELAY_END with its reason byte
    End(u8),
    /// The circuit or connection died underneath the stream
    Closed(TorError),
}

/// A byte stream through a circuit.
pub struct TorStream {
    circuit: Arc<CircuitShared>,
    id: u16,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    /// DATA cells consumed since the last stream SENDME we sent
    delivered_since_sendme: u32,
    /// Cells we may still send before the far end owes us a SENDME
    package_window: i32,
    /// Set once END was seen or sent; further receives yield end-of-stream
    closed: bool,
}

impl TorStream {
    /// Open a directory stream to the circuit's terminal hop (BEGIN_DIR).
    pub async fn connect_to_directory(circuit: &TorCircuit) -> Result<TorStream> {
        Self::connect(circuit, None).await
    }

    /// Open a stream to `host:port` through the exit (BEGIN).
    pub async fn connect_to_outside(
        circuit: &TorCircuit,
        host: &str,
        port: u16,
    ) -> Result<TorStream> {
        Self::connect(circuit, Some((host, port))).await
    }

    async fn connect(circuit: &TorCircuit, target: Option<(&str, u16)>) -> Result<TorStream> {
        let shared = Arc::clone(&circuit.shared);
        let (id, events) = shared.register_stream()?;

        let begin = match target {
            Some((host, port)) => {
                log::info!("Opening stream {} to {}:{}", id, host, port);
                RelayCellPlain::begin(id, host, port)?
            }
            None => {
                log::info!("Opening directory stream {}", id);
                RelayCellPlain::begin_dir(id)?
            }
        };

        if let Err(err) = shared.send_relay(begin, false).await {
            shared.remove_stream(id);
            return Err(err);
        }

        let mut stream = TorStream {
            circuit: shared,
            id,
            events,
            delivered_since_sendme: 0,
            package_window: STREAM_INITIAL_WINDOW,
            closed: false,
        };

        match stream.events.next().await {
            Some(StreamEvent::Connected) => {
                log::info!("✅ Stream {} connected", id);
                Ok(stream)
            }
            Some(StreamEvent::End(reason)) => {
                stream.circuit.remove_stream(id);
                Err(TorError::StreamClosed { reason })
            }
            Some(StreamEvent::Closed(err)) => Err(err),
            Some(other) => {
                stream.circuit.remove_stream(id);
                Err(TorError::Protocol(format!(
                    "Unexpected reply to BEGIN: {:?}",
                    other
                )))
            }
            None => Err(TorError::CircuitClosed(
                "Circuit went away while opening stream".into(),
            )),
        }
    }

    pub fn stream_id(&self) -> u16 {
        self.id
    }

    /// Send `data`, fragmented into DATA cells of at most 498 bytes.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(TorError::StreamClosed {
                reason: END_REASON_DONE,
            });
        }
        for chunk in data.chunks(MAX_RELAY_DATA_LEN) {
            let cell = RelayCellPlain::data(self.id, chunk.to_vec())?;
            self.circuit.send_relay(cell, false).await?;
            self.package_window -= 1;
            if self.package_window <= 0 {
                log::debug!(
                    "Stream {}: package window exhausted ({})",
                    self.id,
                    self.package_window
                );
            }
        }
        Ok(())
    }

    /// Next DATA payload in arrival order, or `None` at end-of-stream
    /// (RELAY_END or clean local close). Circuit or connection loss is an
    /// error, not end-of-stream.
    pub async fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        if self.closed {
            return Ok(None);
        }
        loop {
            match self.events.next().await {
                Some(StreamEvent::Data(data)) => {
                    self.note_delivered().await?;
                    return Ok(Some(data));
                }
                Some(StreamEvent::Sendme) => {
                    self.package_window += STREAM_SENDME_INCREMENT as i32;
                    continue;
                }
                Some(StreamEvent::Connected) => {
                    // Late duplicate; harmless.
                    continue;
                }
                Some(StreamEvent::End(reason)) => {
                    log::debug!("Stream {}: END (reason {})", self.id, reason);
                    self.closed = true;
                    return Ok(None);
                }
                Some(StreamEvent::Closed(err)) => {
                    self.closed = true;
                    return Err(err);
                }
                None => {
                    self.closed = true;
                    return Err(TorError::CircuitClosed(
                        "Circuit went away under the stream".into(),
                    ));
                }
            }
        }
    }

    /// Read until end-of-stream and return everything.
    pub async fn receive_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.receive().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Delivery-side flow accounting: emit stream and circuit SENDMEs as
    /// the windows drain.
    async fn note_delivered(&mut self) -> Result<()> {
        self.delivered_since_sendme += 1;
        if self.delivered_since_sendme >= STREAM_SENDME_INCREMENT {
            self.delivered_since_sendme -= STREAM_SENDME_INCREMENT;
            log::debug!("Stream {}: sending stream-level SENDME", self.id);
            let cell = RelayCellPlain::sendme(self.id)?;
            self.circuit.send_relay(cell, false).await?;
        }
        if self.circuit.take_circuit_sendme_due() {
            log::debug!("Stream {}: sending circuit-level SENDME", self.id);
            let cell = RelayCellPlain::sendme(0)?;
            self.circuit.send_relay(cell, false).await?;
        }
        Ok(())
    }

    /// Close with RELAY_END (reason DONE) and release the stream id.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.circuit.remove_stream(self.id);

        let cell = RelayCellPlain::end(self.id, END_REASON_DONE)?;
        let result = self.circuit.send_relay(cell, false).await;
        log::debug!("Stream {} closed", self.id);
        result
    }
}
