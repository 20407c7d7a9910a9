//! Streams multiplexed on a circuit

use super::{Circuit, StreamEvent};
use crate::error::{Result, TorError};
use crate::protocol::{end_reason, RelayCell, RelayMsg, ResolvedAnswer, StreamFlowControl, StreamId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Where a new stream should lead
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    /// TCP connection opened by the exit
    Host { address: String, port: u16 },
    /// The last hop's directory port (BEGIN_DIR)
    Directory,
    /// A port of the hidden service at the end of a rendezvous circuit
    HiddenService { port: u16 },
}

impl StreamTarget {
    pub(crate) fn begin_msg(&self) -> RelayMsg {
        match self {
            StreamTarget::Host { address, port } => RelayMsg::Begin {
                address: address.clone(),
                port: *port,
            },
            StreamTarget::Directory => RelayMsg::BeginDir,
            // The service ignores the address part
            StreamTarget::HiddenService { port } => RelayMsg::Begin {
                address: String::new(),
                port: *port,
            },
        }
    }
}

impl fmt::Display for StreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamTarget::Host { address, port } => write!(f, "{}:{}", address, port),
            StreamTarget::Directory => write!(f, "<directory>"),
            StreamTarget::HiddenService { port } => write!(f, "<service>:{}", port),
        }
    }
}

/// A bidirectional byte stream through a circuit
///
/// Dropping an open stream sends END with reason DONE.
pub struct Stream {
    id: StreamId,
    circuit: Arc<Circuit>,
    hop: usize,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    flow: Arc<StreamFlowControl>,
    buffer: Vec<u8>,
    offset: usize,
    established: bool,
    remote_end: Option<u8>,
    local_ended: bool,
}

impl Stream {
    pub(super) fn new(
        id: StreamId,
        circuit: Arc<Circuit>,
        hop: usize,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        flow: Arc<StreamFlowControl>,
        established: bool,
    ) -> Self {
        Self {
            id,
            circuit,
            hop,
            events,
            flow,
            buffer: Vec::new(),
            offset: 0,
            established,
            remote_end: None,
            local_ended: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Hop the stream terminates at
    pub fn hop(&self) -> usize {
        self.hop
    }

    /// Circuit carrying this stream
    pub fn circuit(&self) -> &Arc<Circuit> {
        &self.circuit
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    /// END reason sent by the far side, once it has closed
    pub fn remote_end_reason(&self) -> Option<u8> {
        self.remote_end
    }

    pub(super) async fn wait_connected(&mut self, wait: Duration) -> Result<()> {
        let outcome = tokio::time::timeout(wait, async {
            loop {
                match self.events.recv().await {
                    Some(StreamEvent::Connected) => return Ok(()),
                    Some(StreamEvent::End(reason)) => {
                        self.remote_end = Some(reason);
                        return Err(self.closed_error(reason));
                    }
                    Some(StreamEvent::Data(data)) => self.buffer.extend_from_slice(&data),
                    Some(StreamEvent::Resolved(_)) => {
                        return Err(TorError::ProtocolError(
                            "RESOLVED on a stream waiting for CONNECTED".into(),
                        ))
                    }
                    None => return Err(self.closed_error(end_reason::DESTROY)),
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                self.established = true;
                Ok(())
            }
            Ok(Err(e)) => {
                self.local_ended = true;
                self.circuit.end_stream(self.id, end_reason::DONE);
                Err(e)
            }
            Err(_) => {
                self.local_ended = true;
                self.circuit.end_stream(self.id, end_reason::TIMEOUT);
                Err(TorError::StreamTimeout(format!(
                    "Stream {} not connected after {:?}",
                    self.id, wait
                )))
            }
        }
    }

    pub(super) async fn wait_resolved(&mut self, wait: Duration) -> Result<Vec<ResolvedAnswer>> {
        let outcome = tokio::time::timeout(wait, async {
            match self.events.recv().await {
                Some(StreamEvent::Resolved(answers)) => Ok(answers),
                Some(StreamEvent::End(reason)) => Err(self.closed_error(reason)),
                Some(_) => Err(TorError::ProtocolError("Unexpected answer to RESOLVE".into())),
                None => Err(self.closed_error(end_reason::DESTROY)),
            }
        })
        .await;

        // A RESOLVE stream is finished as soon as the answer arrives
        self.local_ended = true;
        self.circuit.end_stream(self.id, end_reason::DONE);
        match outcome {
            Ok(result) => result,
            Err(_) => Err(TorError::StreamTimeout(format!("No RESOLVED after {:?}", wait))),
        }
    }

    /// Error for a stream closed with `reason`; a destroyed circuit reports why it died
    fn closed_error(&self, reason: u8) -> TorError {
        if reason == end_reason::DESTROY && self.circuit.is_destroyed() {
            self.circuit.destroyed_error()
        } else {
            TorError::StreamClosed(reason)
        }
    }

    /// Answer an incoming BEGIN (service side)
    pub fn accept(&mut self) -> Result<()> {
        self.established = true;
        self.circuit.send_relay(
            self.hop,
            RelayMsg::Connected {
                address: None,
                ttl: None,
            },
            self.id,
        )
    }

    /// Read into `buf`; `Ok(0)` means the far end closed the stream
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        while self.offset >= self.buffer.len() {
            self.buffer.clear();
            self.offset = 0;
            if self.remote_end.is_some() {
                return Ok(0);
            }
            match self.events.recv().await {
                Some(StreamEvent::Data(data)) => self.buffer = data,
                Some(StreamEvent::End(reason)) => {
                    log::debug!("Stream {} ended by peer: reason {}", self.id, reason);
                    self.remote_end = Some(reason);
                }
                Some(StreamEvent::Connected) | Some(StreamEvent::Resolved(_)) => {}
                None => self.remote_end = Some(end_reason::DESTROY),
            }
        }
        let n = buf.len().min(self.buffer.len() - self.offset);
        buf[..n].copy_from_slice(&self.buffer[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }

    /// Read until the far end closes the stream
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; RelayCell::MAX_DATA_SIZE];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// Send all of `data`, split into DATA cells
    ///
    /// Blocks while the stream or circuit send window is empty.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if self.local_ended {
            return Err(TorError::Stream(format!("Stream {} is closed", self.id)));
        }
        if let Some(reason) = self.remote_end {
            return Err(TorError::StreamClosed(reason));
        }
        for chunk in data.chunks(RelayCell::MAX_DATA_SIZE) {
            self.circuit.reserve_data_cell(&self.flow).await?;
            self.circuit
                .send_relay(self.hop, RelayMsg::Data(chunk.to_vec()), self.id)?;
        }
        Ok(())
    }

    /// Close our side with END(DONE)
    pub fn close(mut self) {
        self.end(end_reason::DONE);
    }

    /// Close our side with the given END reason
    pub fn end(&mut self, reason: u8) {
        if !self.local_ended {
            self.local_ended = true;
            self.circuit.end_stream(self.id, reason);
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.end(end_reason::DONE);
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("circuit", &self.circuit.serial())
            .field("established", &self.established)
            .field("remote_end", &self.remote_end)
            .finish()
    }
}
