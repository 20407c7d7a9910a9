//! Typed relay messages
//!
//! Every relay command body is one variant of [`RelayMsg`]. Encoding
//! produces the `data` part of a [`RelayCell`]; decoding works from a
//! cell that has already been recognized and parsed.

use crate::error::{Result, TorError};
use crate::protocol::cell::{RelayCell, RelayCommand, StreamId};
use crate::protocol::handshake::{DH_REPLY_LEN, ONION_SKIN_LEN};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// RELAY_END reason codes
pub mod end_reason {
    pub const MISC: u8 = 1;
    pub const RESOLVEFAILED: u8 = 2;
    pub const CONNECTREFUSED: u8 = 3;
    pub const EXITPOLICY: u8 = 4;
    pub const DESTROY: u8 = 5;
    pub const DONE: u8 = 6;
    pub const TIMEOUT: u8 = 7;
    pub const NOROUTE: u8 = 8;
    pub const HIBERNATING: u8 = 9;
    pub const INTERNAL: u8 = 10;
    pub const RESOURCELIMIT: u8 = 11;
    pub const CONNRESET: u8 = 12;
    pub const TORPROTOCOL: u8 = 13;
    pub const NOTDIRECTORY: u8 = 14;
}

/// Length of a rendezvous cookie
pub const COOKIE_LEN: usize = 20;

/// Length of a router identity digest
pub const IDENTITY_LEN: usize = 20;

/// One answer of a RELAY_RESOLVED
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAnswer {
    Address { addr: IpAddr, ttl: u32 },
    /// Transient (0xF0) or permanent (0xF1) resolution error
    Error { transient: bool, ttl: u32 },
}

/// A decoded relay message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMsg {
    /// Open a stream to `address:port`; an empty address targets the hidden service itself
    Begin { address: String, port: u16 },
    BeginDir,
    Data(Vec<u8>),
    End { reason: u8 },
    Connected { address: Option<Ipv4Addr>, ttl: Option<u32> },
    Sendme,
    Extend {
        address: Ipv4Addr,
        port: u16,
        onion_skin: Vec<u8>,
        identity: [u8; IDENTITY_LEN],
    },
    Extended { reply: Vec<u8> },
    Truncate,
    Truncated { reason: u8 },
    Drop,
    Resolve { hostname: String },
    Resolved(Vec<ResolvedAnswer>),
    EstablishIntro {
        service_key_der: Vec<u8>,
        handshake_auth: [u8; 20],
        signature: Vec<u8>,
    },
    EstablishRendezvous { cookie: [u8; COOKIE_LEN] },
    Introduce1 { pk_id: [u8; 20], encrypted: Vec<u8> },
    Introduce2 { pk_id: [u8; 20], encrypted: Vec<u8> },
    Rendezvous1 { cookie: [u8; COOKIE_LEN], reply: Vec<u8> },
    Rendezvous2 { reply: Vec<u8> },
    IntroEstablished,
    RendezvousEstablished,
    /// An empty INTRODUCE_ACK accepts; anything else is a nack
    IntroduceAck { accepted: bool },
}

fn take<'a>(body: &'a [u8], at: &mut usize, n: usize, what: &str) -> Result<&'a [u8]> {
    if *at + n > body.len() {
        return Err(TorError::ProtocolError(format!("Truncated {}", what)));
    }
    let out = &body[*at..*at + n];
    *at += n;
    Ok(out)
}

fn array20(bytes: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes[..20]);
    out
}

fn nul_terminated(body: &[u8], what: &str) -> Result<String> {
    let end = body
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TorError::ProtocolError(format!("{} not NUL-terminated", what)))?;
    String::from_utf8(body[..end].to_vec())
        .map_err(|_| TorError::ProtocolError(format!("{} is not UTF-8", what)))
}

/// Bytes of an ESTABLISH_INTRO body covered by its signature
pub fn establish_intro_signed_part(service_key_der: &[u8], handshake_auth: &[u8; 20]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + service_key_der.len() + 20);
    out.extend_from_slice(&(service_key_der.len() as u16).to_be_bytes());
    out.extend_from_slice(service_key_der);
    out.extend_from_slice(handshake_auth);
    out
}

impl RelayMsg {
    /// Relay command carrying this message
    pub fn command(&self) -> RelayCommand {
        match self {
            RelayMsg::Begin { .. } => RelayCommand::Begin,
            RelayMsg::BeginDir => RelayCommand::BeginDir,
            RelayMsg::Data(_) => RelayCommand::Data,
            RelayMsg::End { .. } => RelayCommand::End,
            RelayMsg::Connected { .. } => RelayCommand::Connected,
            RelayMsg::Sendme => RelayCommand::Sendme,
            RelayMsg::Extend { .. } => RelayCommand::Extend,
            RelayMsg::Extended { .. } => RelayCommand::Extended,
            RelayMsg::Truncate => RelayCommand::Truncate,
            RelayMsg::Truncated { .. } => RelayCommand::Truncated,
            RelayMsg::Drop => RelayCommand::Drop,
            RelayMsg::Resolve { .. } => RelayCommand::Resolve,
            RelayMsg::Resolved(_) => RelayCommand::Resolved,
            RelayMsg::EstablishIntro { .. } => RelayCommand::EstablishIntro,
            RelayMsg::EstablishRendezvous { .. } => RelayCommand::EstablishRendezvous,
            RelayMsg::Introduce1 { .. } => RelayCommand::Introduce1,
            RelayMsg::Introduce2 { .. } => RelayCommand::Introduce2,
            RelayMsg::Rendezvous1 { .. } => RelayCommand::Rendezvous1,
            RelayMsg::Rendezvous2 { .. } => RelayCommand::Rendezvous2,
            RelayMsg::IntroEstablished => RelayCommand::IntroEstablished,
            RelayMsg::RendezvousEstablished => RelayCommand::RendezvousEstablished,
            RelayMsg::IntroduceAck { .. } => RelayCommand::IntroduceAck,
        }
    }

    /// Serialize the message body
    pub fn encode_body(&self) -> Vec<u8> {
        match self {
            RelayMsg::Begin { address, port } => format!("{}:{}\0", address, port).into_bytes(),
            RelayMsg::Data(data) => data.clone(),
            RelayMsg::End { reason } | RelayMsg::Truncated { reason } => vec![*reason],
            RelayMsg::Connected { address, ttl } => match address {
                Some(ip) => {
                    let mut out = ip.octets().to_vec();
                    out.extend_from_slice(&ttl.unwrap_or(0).to_be_bytes());
                    out
                }
                None => Vec::new(),
            },
            RelayMsg::Extend {
                address,
                port,
                onion_skin,
                identity,
            } => {
                let mut out = Vec::with_capacity(6 + onion_skin.len() + IDENTITY_LEN);
                out.extend_from_slice(&address.octets());
                out.extend_from_slice(&port.to_be_bytes());
                out.extend_from_slice(onion_skin);
                out.extend_from_slice(identity);
                out
            }
            RelayMsg::Extended { reply } | RelayMsg::Rendezvous2 { reply } => reply.clone(),
            RelayMsg::Resolve { hostname } => format!("{}\0", hostname).into_bytes(),
            RelayMsg::Resolved(answers) => {
                let mut out = Vec::new();
                for answer in answers {
                    match answer {
                        ResolvedAnswer::Address {
                            addr: IpAddr::V4(v4),
                            ttl,
                        } => {
                            out.extend_from_slice(&[4, 4]);
                            out.extend_from_slice(&v4.octets());
                            out.extend_from_slice(&ttl.to_be_bytes());
                        }
                        ResolvedAnswer::Address {
                            addr: IpAddr::V6(v6),
                            ttl,
                        } => {
                            out.extend_from_slice(&[6, 16]);
                            out.extend_from_slice(&v6.octets());
                            out.extend_from_slice(&ttl.to_be_bytes());
                        }
                        ResolvedAnswer::Error { transient, ttl } => {
                            out.extend_from_slice(&[if *transient { 0xF0 } else { 0xF1 }, 0]);
                            out.extend_from_slice(&ttl.to_be_bytes());
                        }
                    }
                }
                out
            }
            RelayMsg::EstablishIntro {
                service_key_der,
                handshake_auth,
                signature,
            } => {
                let mut out = establish_intro_signed_part(service_key_der, handshake_auth);
                out.extend_from_slice(signature);
                out
            }
            RelayMsg::EstablishRendezvous { cookie } => cookie.to_vec(),
            RelayMsg::Introduce1 { pk_id, encrypted } | RelayMsg::Introduce2 { pk_id, encrypted } => {
                let mut out = pk_id.to_vec();
                out.extend_from_slice(encrypted);
                out
            }
            RelayMsg::Rendezvous1 { cookie, reply } => {
                let mut out = cookie.to_vec();
                out.extend_from_slice(reply);
                out
            }
            RelayMsg::IntroduceAck { accepted } => {
                if *accepted {
                    Vec::new()
                } else {
                    vec![1]
                }
            }
            RelayMsg::BeginDir
            | RelayMsg::Sendme
            | RelayMsg::Truncate
            | RelayMsg::Drop
            | RelayMsg::IntroEstablished
            | RelayMsg::RendezvousEstablished => Vec::new(),
        }
    }

    /// Wrap the message into a relay cell for `stream_id`
    pub fn into_relay_cell(self, stream_id: StreamId) -> Result<RelayCell> {
        RelayCell::new(self.command(), stream_id, self.encode_body())
    }

    /// Decode the body of a parsed relay cell
    pub fn decode(cell: &RelayCell) -> Result<Self> {
        let body = &cell.data[..];
        let mut at = 0usize;
        let msg = match cell.command {
            RelayCommand::Begin => {
                let target = nul_terminated(body, "BEGIN target")?;
                let (address, port) = target
                    .rsplit_once(':')
                    .ok_or_else(|| TorError::ProtocolError("BEGIN target lacks port".into()))?;
                let port = port
                    .parse()
                    .map_err(|_| TorError::ProtocolError("BEGIN port is not a number".into()))?;
                RelayMsg::Begin {
                    address: address.to_string(),
                    port,
                }
            }
            RelayCommand::BeginDir => RelayMsg::BeginDir,
            RelayCommand::Data => RelayMsg::Data(body.to_vec()),
            RelayCommand::End => RelayMsg::End {
                reason: body.first().copied().unwrap_or(end_reason::MISC),
            },
            RelayCommand::Connected => {
                if body.len() >= 8 {
                    RelayMsg::Connected {
                        address: Some(Ipv4Addr::new(body[0], body[1], body[2], body[3])),
                        ttl: Some(u32::from_be_bytes([body[4], body[5], body[6], body[7]])),
                    }
                } else {
                    RelayMsg::Connected {
                        address: None,
                        ttl: None,
                    }
                }
            }
            RelayCommand::Sendme => RelayMsg::Sendme,
            RelayCommand::Extend => {
                let ip = take(body, &mut at, 4, "EXTEND address")?;
                let port = take(body, &mut at, 2, "EXTEND port")?;
                let onion_skin = take(body, &mut at, ONION_SKIN_LEN, "EXTEND onion skin")?;
                let identity = take(body, &mut at, IDENTITY_LEN, "EXTEND identity")?;
                RelayMsg::Extend {
                    address: Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]),
                    port: u16::from_be_bytes([port[0], port[1]]),
                    onion_skin: onion_skin.to_vec(),
                    identity: array20(identity),
                }
            }
            RelayCommand::Extended => RelayMsg::Extended {
                reply: take(body, &mut at, DH_REPLY_LEN, "EXTENDED")?.to_vec(),
            },
            RelayCommand::Truncate => RelayMsg::Truncate,
            RelayCommand::Truncated => RelayMsg::Truncated {
                reason: body.first().copied().unwrap_or(0),
            },
            RelayCommand::Drop => RelayMsg::Drop,
            RelayCommand::Resolve => RelayMsg::Resolve {
                hostname: nul_terminated(body, "RESOLVE hostname")?,
            },
            RelayCommand::Resolved => {
                let mut answers = Vec::new();
                while at < body.len() {
                    let header = take(body, &mut at, 2, "RESOLVED answer")?;
                    let (kind, len) = (header[0], header[1] as usize);
                    let value = take(body, &mut at, len, "RESOLVED value")?;
                    let ttl = take(body, &mut at, 4, "RESOLVED ttl")?;
                    let ttl = u32::from_be_bytes([ttl[0], ttl[1], ttl[2], ttl[3]]);
                    let answer = match (kind, len) {
                        (4, 4) => ResolvedAnswer::Address {
                            addr: IpAddr::V4(Ipv4Addr::new(value[0], value[1], value[2], value[3])),
                            ttl,
                        },
                        (6, 16) => {
                            let mut octets = [0u8; 16];
                            octets.copy_from_slice(value);
                            ResolvedAnswer::Address {
                                addr: IpAddr::V6(Ipv6Addr::from(octets)),
                                ttl,
                            }
                        }
                        (0xF0, _) => ResolvedAnswer::Error {
                            transient: true,
                            ttl,
                        },
                        (0xF1, _) => ResolvedAnswer::Error {
                            transient: false,
                            ttl,
                        },
                        // Hostname answers and unknown types are skipped
                        _ => continue,
                    };
                    answers.push(answer);
                }
                RelayMsg::Resolved(answers)
            }
            RelayCommand::EstablishIntro => {
                let len = take(body, &mut at, 2, "ESTABLISH_INTRO key length")?;
                let len = u16::from_be_bytes([len[0], len[1]]) as usize;
                let der = take(body, &mut at, len, "ESTABLISH_INTRO key")?.to_vec();
                let hs = take(body, &mut at, 20, "ESTABLISH_INTRO handshake auth")?;
                RelayMsg::EstablishIntro {
                    service_key_der: der,
                    handshake_auth: array20(hs),
                    signature: body[at..].to_vec(),
                }
            }
            RelayCommand::EstablishRendezvous => RelayMsg::EstablishRendezvous {
                cookie: array20(take(body, &mut at, COOKIE_LEN, "rendezvous cookie")?),
            },
            RelayCommand::Introduce1 | RelayCommand::Introduce2 => {
                let pk_id = array20(take(body, &mut at, 20, "INTRODUCE key id")?);
                let encrypted = body[at..].to_vec();
                if cell.command == RelayCommand::Introduce1 {
                    RelayMsg::Introduce1 { pk_id, encrypted }
                } else {
                    RelayMsg::Introduce2 { pk_id, encrypted }
                }
            }
            RelayCommand::Rendezvous1 => {
                let cookie = array20(take(body, &mut at, COOKIE_LEN, "RENDEZVOUS1 cookie")?);
                let reply = take(body, &mut at, DH_REPLY_LEN, "RENDEZVOUS1 handshake")?.to_vec();
                RelayMsg::Rendezvous1 { cookie, reply }
            }
            RelayCommand::Rendezvous2 => RelayMsg::Rendezvous2 {
                reply: take(body, &mut at, DH_REPLY_LEN, "RENDEZVOUS2 handshake")?.to_vec(),
            },
            RelayCommand::IntroEstablished => RelayMsg::IntroEstablished,
            RelayCommand::RendezvousEstablished => RelayMsg::RendezvousEstablished,
            RelayCommand::IntroduceAck => RelayMsg::IntroduceAck {
                accepted: body.is_empty(),
            },
        };
        Ok(msg)
    }
}
