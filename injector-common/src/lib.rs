//! # Control-channel protocol (supervisor ↔ companion daemons / control client)
//!
//! The supervisor listens on a unix datagram socket. One datagram carries one
//! message: a single opcode byte followed by length-prefixed fields. A length
//! prefix is a little-endian `u32` byte count followed by exactly that many
//! bytes, no terminator.
//!
//! Companion daemons link this crate to report their state; the `ctl`
//! subcommand of the injector uses it to request start/stop/exit.

use std::os::unix::net::UnixDatagram;
use std::path::Path;

use thiserror::Error;

/// Width of the ABI a message refers to. The supervisor tracks 64-bit and
/// 32-bit zygotes (and their companion daemons) independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiWidth {
    Abi64,
    Abi32,
}

impl AbiWidth {
    /// Suffix used in binary names, library directories and status output.
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            AbiWidth::Abi64 => "64",
            AbiWidth::Abi32 => "32",
        }
    }
}

/// Single-byte opcodes, first byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlOp {
    Start = 1,
    Stop = 2,
    Exit = 3,
    ZygoteInjected64 = 4,
    ZygoteInjected32 = 5,
    DaemonInfo64 = 6,
    DaemonInfo32 = 7,
    DaemonError64 = 8,
    DaemonError32 = 9,
}

impl TryFrom<u8> for ControlOp {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            1 => ControlOp::Start,
            2 => ControlOp::Stop,
            3 => ControlOp::Exit,
            4 => ControlOp::ZygoteInjected64,
            5 => ControlOp::ZygoteInjected32,
            6 => ControlOp::DaemonInfo64,
            7 => ControlOp::DaemonInfo32,
            8 => ControlOp::DaemonError64,
            9 => ControlOp::DaemonError32,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }
}

/// A fully decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Start,
    Stop,
    Exit,
    ZygoteInjected(AbiWidth),
    DaemonInfo { abi: AbiWidth, root_impl: String, modules: Vec<String> },
    DaemonError { abi: AbiWidth, text: String },
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("empty control datagram")]
    Empty,

    #[error("unknown control opcode {0}")]
    UnknownOpcode(u8),

    #[error("truncated control message: {0}")]
    Truncated(&'static str),

    #[error("control payload is not valid UTF-8")]
    BadEncoding,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reader over a single received datagram.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(len).ok_or(ProtocolError::Truncated(what))?;
        if end > self.buf.len() {
            return Err(ProtocolError::Truncated(what));
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_u32(&mut self, what: &'static str) -> Result<u32, ProtocolError> {
        let raw = self.take(4, what)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn read_string(&mut self, what: &'static str) -> Result<String, ProtocolError> {
        let len = self.read_u32(what)? as usize;
        let raw = self.take(len, what)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::BadEncoding)
    }
}

fn push_string(out: &mut Vec<u8>, s: &str) {
    // Length prefixes are byte counts, never character counts.
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

impl ControlMessage {
    /// Decode one datagram.
    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        let (&op, rest) = datagram.split_first().ok_or(ProtocolError::Empty)?;
        let mut cur = Cursor::new(rest);

        let msg = match ControlOp::try_from(op)? {
            ControlOp::Start => ControlMessage::Start,
            ControlOp::Stop => ControlMessage::Stop,
            ControlOp::Exit => ControlMessage::Exit,
            ControlOp::ZygoteInjected64 => ControlMessage::ZygoteInjected(AbiWidth::Abi64),
            ControlOp::ZygoteInjected32 => ControlMessage::ZygoteInjected(AbiWidth::Abi32),
            op @ (ControlOp::DaemonInfo64 | ControlOp::DaemonInfo32) => {
                let abi =
                    if op == ControlOp::DaemonInfo64 { AbiWidth::Abi64 } else { AbiWidth::Abi32 };
                let root_impl = cur.read_string("root impl")?;
                let count = cur.read_u32("module count")?;
                let mut modules = Vec::new();
                for _ in 0..count {
                    modules.push(cur.read_string("module name")?);
                }
                ControlMessage::DaemonInfo { abi, root_impl, modules }
            }
            op @ (ControlOp::DaemonError64 | ControlOp::DaemonError32) => {
                let abi =
                    if op == ControlOp::DaemonError64 { AbiWidth::Abi64 } else { AbiWidth::Abi32 };
                let text = cur.read_string("error text")?;
                ControlMessage::DaemonError { abi, text }
            }
        };
        Ok(msg)
    }

    /// Encode into a single datagram.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            ControlMessage::Start => out.push(ControlOp::Start as u8),
            ControlMessage::Stop => out.push(ControlOp::Stop as u8),
            ControlMessage::Exit => out.push(ControlOp::Exit as u8),
            ControlMessage::ZygoteInjected(abi) => out.push(match abi {
                AbiWidth::Abi64 => ControlOp::ZygoteInjected64 as u8,
                AbiWidth::Abi32 => ControlOp::ZygoteInjected32 as u8,
            }),
            ControlMessage::DaemonInfo { abi, root_impl, modules } => {
                out.push(match abi {
                    AbiWidth::Abi64 => ControlOp::DaemonInfo64 as u8,
                    AbiWidth::Abi32 => ControlOp::DaemonInfo32 as u8,
                });
                push_string(&mut out, root_impl);
                #[allow(clippy::cast_possible_truncation)]
                out.extend_from_slice(&(modules.len() as u32).to_le_bytes());
                for m in modules {
                    push_string(&mut out, m);
                }
            }
            ControlMessage::DaemonError { abi, text } => {
                out.push(match abi {
                    AbiWidth::Abi64 => ControlOp::DaemonError64 as u8,
                    AbiWidth::Abi32 => ControlOp::DaemonError32 as u8,
                });
                push_string(&mut out, text);
            }
        }
        out
    }

    /// Fire-and-forget send to the supervisor socket.
    pub fn send_to(&self, socket_path: &Path) -> Result<(), ProtocolError> {
        let sock = UnixDatagram::unbound()?;
        sock.send_to(&self.encode(), socket_path)?;
        Ok(())
    }
}
