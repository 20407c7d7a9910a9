//! Cell protocol
//!
//! Implements the fixed-size cell format exchanged with relays, and the
//! relay-cell header carried inside RELAY / RELAY_EARLY payloads.
//! Cells are the basic unit of communication in the protocol.

use crate::error::{Result, TorError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Circuit identifier, scoped to one transport connection
pub type CircuitId = u16;

/// Stream identifier, scoped to one circuit
pub type StreamId = u16;

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - link-level keepalive
    Padding = 0,
    /// CREATE - create a circuit with the DH handshake
    Create = 1,
    /// CREATED - answer to CREATE
    Created = 2,
    /// RELAY - relay cell
    Relay = 3,
    /// DESTROY - destroy a circuit
    Destroy = 4,
    /// CREATE_FAST - create a circuit without public-key crypto
    CreateFast = 5,
    /// CREATED_FAST - answer to CREATE_FAST
    CreatedFast = 6,
    /// RELAY_EARLY - relay cell allowed to carry EXTEND
    RelayEarly = 9,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            9 => Some(CellCommand::RelayEarly),
            _ => None,
        }
    }

    /// Whether the payload is an onion-encrypted relay cell
    pub fn is_relay(self) -> bool {
        matches!(self, CellCommand::Relay | CellCommand::RelayEarly)
    }
}

/// A fixed-size cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit ID (2 bytes)
    pub circuit_id: CircuitId,

    /// Command
    pub command: CellCommand,

    /// Payload, always exactly 509 bytes
    pub payload: [u8; Cell::PAYLOAD_SIZE],
}

impl Cell {
    /// Cell size (512 bytes total: 2 circuit_id + 1 command + 509 payload)
    pub const SIZE: usize = 512;

    /// Payload size for fixed-length cells
    pub const PAYLOAD_SIZE: usize = 509;

    /// Create a new cell; the payload is zero-padded to 509 bytes
    ///
    /// Payloads longer than 509 bytes are rejected.
    pub fn new(circuit_id: CircuitId, command: CellCommand, payload: &[u8]) -> Result<Self> {
        if payload.len() > Self::PAYLOAD_SIZE {
            return Err(TorError::ProtocolError(format!(
                "Cell payload of {} bytes exceeds {}",
                payload.len(),
                Self::PAYLOAD_SIZE
            )));
        }
        let mut padded = [0u8; Self::PAYLOAD_SIZE];
        padded[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            circuit_id,
            command,
            payload: padded,
        })
    }

    /// Create a cell around an already-built 509-byte payload
    pub fn with_payload(
        circuit_id: CircuitId,
        command: CellCommand,
        payload: [u8; Cell::PAYLOAD_SIZE],
    ) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    /// Create a DESTROY cell
    pub fn destroy(circuit_id: CircuitId, reason: u8) -> Self {
        let mut payload = [0u8; Self::PAYLOAD_SIZE];
        payload[0] = reason;
        Self::with_payload(circuit_id, CellCommand::Destroy, payload)
    }

    /// Create a link-level PADDING cell
    pub fn padding() -> Self {
        Self::with_payload(0, CellCommand::Padding, [0u8; Self::PAYLOAD_SIZE])
    }

    /// Serialize cell to its 512-byte wire form
    pub fn to_bytes(&self) -> [u8; Cell::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.circuit_id.to_be_bytes());
        buf[2] = self.command as u8;
        buf[3..].copy_from_slice(&self.payload);
        buf
    }

    /// Parse cell from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(TorError::MalformedCell(format!(
                "Cell too short: {} of {} bytes",
                data.len(),
                Self::SIZE
            )));
        }

        let circuit_id = u16::from_be_bytes([data[0], data[1]]);
        let command = CellCommand::from_u8(data[2])
            .ok_or_else(|| TorError::MalformedCell(format!("Unknown command: {}", data[2])))?;

        let mut payload = [0u8; Self::PAYLOAD_SIZE];
        payload.copy_from_slice(&data[3..Self::SIZE]);

        Ok(Self {
            circuit_id,
            command,
            payload,
        })
    }
}

/// Read exactly one cell from a transport stream
///
/// Blocks across as many reads as needed. A clean EOF before the first
/// byte is `ConnectionClosed`; an EOF in the middle of a cell is
/// `MalformedCell`.
pub async fn read_cell<R>(reader: &mut R) -> Result<Cell>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; Cell::SIZE];
    let mut filled = 0;
    while filled < Cell::SIZE {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|e| TorError::ConnectionClosed(format!("Read failed: {}", e)))?;
        if n == 0 {
            if filled == 0 {
                return Err(TorError::ConnectionClosed("EOF".into()));
            }
            return Err(TorError::MalformedCell(format!(
                "Stream closed after {} of {} bytes",
                filled,
                Cell::SIZE
            )));
        }
        filled += n;
    }
    Cell::from_bytes(&buf)
}

/// Write one cell to a transport stream and flush it
pub async fn write_cell<W>(writer: &mut W, cell: &Cell) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer
        .write_all(&cell.to_bytes())
        .await
        .map_err(|e| TorError::ConnectionClosed(format!("Failed to send cell: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| TorError::ConnectionClosed(format!("Failed to flush: {}", e)))?;
    Ok(())
}

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open stream
    Begin = 1,
    /// DATA - relay data
    Data = 2,
    /// END - close stream
    End = 3,
    /// CONNECTED - stream connected
    Connected = 4,
    /// SENDME - flow control
    Sendme = 5,
    /// EXTEND - extend circuit
    Extend = 6,
    /// EXTENDED - circuit extended
    Extended = 7,
    /// TRUNCATE - truncate circuit
    Truncate = 8,
    /// TRUNCATED - circuit truncated
    Truncated = 9,
    /// DROP - long-range padding
    Drop = 10,
    /// RESOLVE - DNS resolve
    Resolve = 11,
    /// RESOLVED - DNS resolved
    Resolved = 12,
    /// BEGIN_DIR - begin directory connection
    BeginDir = 13,
    /// ESTABLISH_INTRO - service registers at an introduction point
    EstablishIntro = 32,
    /// ESTABLISH_RENDEZVOUS - client registers a cookie at a rendezvous point
    EstablishRendezvous = 33,
    /// INTRODUCE1 - client to introduction point
    Introduce1 = 34,
    /// INTRODUCE2 - introduction point to service
    Introduce2 = 35,
    /// RENDEZVOUS1 - service to rendezvous point
    Rendezvous1 = 36,
    /// RENDEZVOUS2 - rendezvous point to client
    Rendezvous2 = 37,
    /// INTRO_ESTABLISHED - ack of ESTABLISH_INTRO
    IntroEstablished = 38,
    /// RENDEZVOUS_ESTABLISHED - ack of ESTABLISH_RENDEZVOUS
    RendezvousEstablished = 39,
    /// INTRODUCE_ACK - ack of INTRODUCE1
    IntroduceAck = 40,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            32 => Some(RelayCommand::EstablishIntro),
            33 => Some(RelayCommand::EstablishRendezvous),
            34 => Some(RelayCommand::Introduce1),
            35 => Some(RelayCommand::Introduce2),
            36 => Some(RelayCommand::Rendezvous1),
            37 => Some(RelayCommand::Rendezvous2),
            38 => Some(RelayCommand::IntroEstablished),
            39 => Some(RelayCommand::RendezvousEstablished),
            40 => Some(RelayCommand::IntroduceAck),
            _ => None,
        }
    }
}

/// Relay cell (payload within a RELAY or RELAY_EARLY cell)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Relay command
    pub command: RelayCommand,

    /// Recognized (always 0 for a cell addressed to the hop that reads it)
    pub recognized: u16,

    /// Stream ID (0 for circuit-level cells)
    pub stream_id: StreamId,

    /// Digest (4 bytes)
    pub digest: [u8; 4],

    /// Length of data
    pub length: u16,

    /// Data (up to 498 bytes)
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Maximum data size in relay cell
    pub const MAX_DATA_SIZE: usize = 498;

    /// Size of the relay header that precedes the data
    pub const HEADER_SIZE: usize = 11;

    /// Byte range of the recognized field inside the payload
    pub const RECOGNIZED_RANGE: std::ops::Range<usize> = 1..3;

    /// Byte range of the digest field inside the payload
    pub const DIGEST_RANGE: std::ops::Range<usize> = 5..9;

    /// Create a new relay cell
    ///
    /// Data longer than 498 bytes is rejected.
    pub fn new(command: RelayCommand, stream_id: StreamId, data: Vec<u8>) -> Result<Self> {
        if data.len() > Self::MAX_DATA_SIZE {
            return Err(TorError::ProtocolError(format!(
                "Relay data of {} bytes exceeds {}",
                data.len(),
                Self::MAX_DATA_SIZE
            )));
        }
        Ok(Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            length: data.len() as u16,
            data,
        })
    }

    /// Serialize relay cell into a full cell payload
    pub fn to_payload(&self) -> [u8; Cell::PAYLOAD_SIZE] {
        let mut buf = [0u8; Cell::PAYLOAD_SIZE];
        buf[0] = self.command as u8;
        buf[1..3].copy_from_slice(&self.recognized.to_be_bytes());
        buf[3..5].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[5..9].copy_from_slice(&self.digest);
        buf[9..11].copy_from_slice(&self.length.to_be_bytes());
        let n = self.data.len().min(Self::MAX_DATA_SIZE);
        buf[11..11 + n].copy_from_slice(&self.data[..n]);
        buf
    }

    /// Parse relay cell from a decrypted payload
    pub fn from_payload(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE {
            return Err(TorError::ProtocolError("Relay cell too short".into()));
        }

        let command = RelayCommand::from_u8(data[0]).ok_or_else(|| {
            TorError::ProtocolError(format!("Unknown relay command: {}", data[0]))
        })?;

        let recognized = u16::from_be_bytes([data[1], data[2]]);
        let stream_id = u16::from_be_bytes([data[3], data[4]]);
        let digest = [data[5], data[6], data[7], data[8]];
        let length = u16::from_be_bytes([data[9], data[10]]);

        if length as usize > Self::MAX_DATA_SIZE {
            return Err(TorError::ProtocolError(format!(
                "Relay length field {} exceeds {}",
                length,
                Self::MAX_DATA_SIZE
            )));
        }
        let data_end = Self::HEADER_SIZE + length as usize;
        if data_end > data.len() {
            return Err(TorError::ProtocolError("Relay cell data truncated".into()));
        }

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            length,
            data: data[Self::HEADER_SIZE..data_end].to_vec(),
        })
    }
}
