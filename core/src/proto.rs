//! Wire formats.
//!
//! All integers are big-endian and fixed width.
//!
//! Control request: `[envelope][Preamble][command frames...]`
//!
//! Control response: `[envelope][ResponseCode][response frames...]`
//!
//! Invocation request: `[delimiter][RequestHeader][payload]`
//!
//! Invocation response, one or more: `[delimiter][ResponseHeader][payload]`

use crate::envelope::{Frame, Message};
use crate::error::{FabricError, ProtoError};
use crate::id::{InstanceId, NODE_ID_LEN, NodeId, PeerToken, TOKEN_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

#[inline]
fn read_u32(buf: &[u8], offset: usize, what: &'static str) -> Result<u32, ProtoError> {
    match buf.get(offset..offset + 4) {
        Some(b) => Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(ProtoError::Truncated { what, need: offset + 4, have: buf.len() }),
    }
}

#[inline]
fn u32_frame(v: u32) -> Frame {
    Bytes::copy_from_slice(&v.to_be_bytes())
}

/// Control command named by the preamble frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandType {
    GetInstanceStatus = 1,
    OpenRouteToNode = 2,
    OpenBindingForNode = 3,
    CloseBindingForNode = 4,
    CloseRouteToNode = 5,
    CloseRoutesViaInstance = 6,
    Forward = 7,
}

impl TryFrom<u32> for CommandType {
    type Error = ProtoError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CommandType::GetInstanceStatus),
            2 => Ok(CommandType::OpenRouteToNode),
            3 => Ok(CommandType::OpenBindingForNode),
            4 => Ok(CommandType::CloseBindingForNode),
            5 => Ok(CommandType::CloseRouteToNode),
            6 => Ok(CommandType::CloseRoutesViaInstance),
            7 => Ok(CommandType::Forward),
            _ => Err(ProtoError::UnknownCommand(value)),
        }
    }
}

/// `{commandType: u32}`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Preamble(pub u32);

impl Preamble {
    pub const LEN: usize = 4;

    #[inline]
    pub fn new(cmd: CommandType) -> Self {
        Self(cmd as u32)
    }

    #[inline]
    pub fn encode(&self) -> Frame {
        u32_frame(self.0)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtoError> {
        if frame.len() != Self::LEN {
            return Err(ProtoError::Truncated { what: "preamble", need: Self::LEN, have: frame.len() });
        }
        Ok(Self(read_u32(frame, 0, "preamble")?))
    }

    #[inline]
    pub fn command(&self) -> Result<CommandType, ProtoError> {
        CommandType::try_from(self.0)
    }
}

/// Mutation applied by the reactor to its channel tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RoutingAction {
    OpenBackend = 1,
    CloseBackend = 2,
    OpenInproc = 3,
    CloseInproc = 4,
    GetStatus = 5,
}

impl TryFrom<u32> for RoutingAction {
    type Error = ProtoError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RoutingAction::OpenBackend),
            2 => Ok(RoutingAction::CloseBackend),
            3 => Ok(RoutingAction::OpenInproc),
            4 => Ok(RoutingAction::CloseInproc),
            5 => Ok(RoutingAction::GetStatus),
            _ => Err(ProtoError::UnknownAction(value)),
        }
    }
}

/// `{action: u32, tcpAddress: UTF8[64], inprocIdentifier: [u8; 16]}`
///
/// Only the fields relevant to the action are meaningful.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingCommand {
    pub action: RoutingAction,
    pub address: Option<String>,
    pub inproc: Option<PeerToken>,
}

impl RoutingCommand {
    pub const ADDRESS_LEN: usize = 64;
    pub const LEN: usize = 4 + Self::ADDRESS_LEN + TOKEN_LEN;

    pub fn open_backend(address: &str) -> Self {
        Self { action: RoutingAction::OpenBackend, address: Some(address.to_string()), inproc: None }
    }

    pub fn close_backend(address: &str) -> Self {
        Self { action: RoutingAction::CloseBackend, address: Some(address.to_string()), inproc: None }
    }

    pub fn open_inproc(address: &str, token: PeerToken) -> Self {
        Self {
            action: RoutingAction::OpenInproc,
            address: Some(address.to_string()),
            inproc: Some(token),
        }
    }

    pub fn close_inproc(address: &str, token: PeerToken) -> Self {
        Self {
            action: RoutingAction::CloseInproc,
            address: Some(address.to_string()),
            inproc: Some(token),
        }
    }

    pub fn get_status() -> Self {
        Self { action: RoutingAction::GetStatus, address: None, inproc: None }
    }

    pub fn encode(&self) -> Result<Frame, ProtoError> {
        let addr = self.address.as_deref().unwrap_or("");
        if addr.len() > Self::ADDRESS_LEN {
            return Err(ProtoError::AddressTooLong(addr.len()));
        }
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u32(self.action as u32);
        buf.put_slice(addr.as_bytes());
        buf.put_bytes(0, Self::ADDRESS_LEN - addr.len());
        match self.inproc.as_ref() {
            Some(token) => buf.put_slice(token.as_bytes()),
            None => buf.put_bytes(0, TOKEN_LEN),
        }
        Ok(buf.freeze())
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtoError> {
        if frame.len() != Self::LEN {
            return Err(ProtoError::Truncated { what: "routing command", need: Self::LEN, have: frame.len() });
        }
        let action = RoutingAction::try_from(read_u32(frame, 0, "routing action")?)?;
        let raw_addr = &frame[4..4 + Self::ADDRESS_LEN];
        let end = raw_addr.iter().position(|b| *b == 0).unwrap_or(Self::ADDRESS_LEN);
        let address = std::str::from_utf8(&raw_addr[..end])
            .map_err(|_| ProtoError::Malformed("routing address is not utf-8".to_string()))?;
        let token = PeerToken::from_slice(&frame[4 + Self::ADDRESS_LEN..])?;
        Ok(Self {
            action,
            address: if address.is_empty() { None } else { Some(address.to_string()) },
            inproc: if token.is_nil() { None } else { Some(token) },
        })
    }
}

/// `{additionalParts: u32}`, the number of async callback parts the caller expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RequestHeader {
    pub additional_parts: u32,
}

impl RequestHeader {
    pub const LEN: usize = 4;

    #[inline]
    pub fn encode(&self) -> Frame {
        u32_frame(self.additional_parts)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtoError> {
        if frame.len() != Self::LEN {
            return Err(ProtoError::Truncated { what: "request header", need: Self::LEN, have: frame.len() });
        }
        Ok(Self { additional_parts: read_u32(frame, 0, "request header")? })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseKind {
    Result = 0,
    Error = 1,
}

/// `{type: u32, part: u32}`. Part 0 is the synchronous outcome, part N the
/// delivery for the Nth registered callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseHeader {
    pub kind: ResponseKind,
    pub part: u32,
}

impl ResponseHeader {
    pub const LEN: usize = 8;

    #[inline]
    pub fn result(part: u32) -> Self {
        Self { kind: ResponseKind::Result, part }
    }

    #[inline]
    pub fn error(part: u32) -> Self {
        Self { kind: ResponseKind::Error, part }
    }

    pub fn encode(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u32(self.kind as u32);
        buf.put_u32(self.part);
        buf.freeze()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtoError> {
        if frame.len() != Self::LEN {
            return Err(ProtoError::Truncated { what: "response header", need: Self::LEN, have: frame.len() });
        }
        let kind = match read_u32(frame, 0, "response kind")? {
            0 => ResponseKind::Result,
            1 => ResponseKind::Error,
            k => return Err(ProtoError::UnknownKind(k)),
        };
        Ok(Self { kind, part: read_u32(frame, 4, "response part")? })
    }
}

/// First frame of every control response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseCode {
    Ok,
    UnknownCommand,
    NoSuchRoute(NodeId),
    Exception,
    UnknownError,
    NoSuchNode(NodeId),
    NoSuchInstance(InstanceId),
}

impl ResponseCode {
    pub fn code(&self) -> u32 {
        match self {
            ResponseCode::Ok => 0,
            ResponseCode::UnknownCommand => 1,
            ResponseCode::NoSuchRoute(_) => 2,
            ResponseCode::Exception => 3,
            ResponseCode::UnknownError => 4,
            ResponseCode::NoSuchNode(_) => 5,
            ResponseCode::NoSuchInstance(_) => 6,
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, ResponseCode::Ok)
    }

    pub fn encode(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(4 + NODE_ID_LEN);
        buf.put_u32(self.code());
        match self {
            ResponseCode::NoSuchNode(node) | ResponseCode::NoSuchRoute(node) => buf.put_slice(&node.to_bytes()),
            ResponseCode::NoSuchInstance(inst) => buf.put_slice(inst.as_bytes()),
            _ => {}
        }
        buf.freeze()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtoError> {
        let code = read_u32(frame, 0, "response code")?;
        let trailing = &frame[4..];
        let plain = |c: ResponseCode| {
            if trailing.is_empty() {
                Ok(c)
            } else {
                Err(ProtoError::Malformed(format!("trailing bytes after response code {}", code)))
            }
        };
        match code {
            0 => plain(ResponseCode::Ok),
            1 => plain(ResponseCode::UnknownCommand),
            2 => Ok(ResponseCode::NoSuchRoute(NodeId::from_slice(trailing)?)),
            3 => plain(ResponseCode::Exception),
            4 => plain(ResponseCode::UnknownError),
            5 => Ok(ResponseCode::NoSuchNode(NodeId::from_slice(trailing)?)),
            6 => Ok(ResponseCode::NoSuchInstance(InstanceId::from_slice(trailing)?)),
            c => Err(ProtoError::UnknownCode(c)),
        }
    }

    /// The frames following an `OK` code, otherwise the error the code stands for.
    pub fn into_result(self, frames: Message) -> Result<Message, FabricError> {
        match self {
            ResponseCode::Ok => Ok(frames),
            ResponseCode::UnknownCommand => match frames.first() {
                Some(f) => Err(FabricError::UnknownCommand(decode_u32(f, "command code")?)),
                None => Err(ProtoError::Malformed("rejected command code missing".to_string()).into()),
            },
            ResponseCode::Exception => match frames.first() {
                Some(f) => Err(FabricError::Remote(RemoteError::decode(f))),
                None => Err(FabricError::UnknownError),
            },
            ResponseCode::NoSuchRoute(node) => Err(FabricError::NoSuchRoute(node)),
            ResponseCode::NoSuchNode(node) => Err(FabricError::NoSuchNode(node)),
            ResponseCode::NoSuchInstance(instance) => Err(FabricError::NoSuchInstance(instance)),
            ResponseCode::UnknownError => Err(FabricError::UnknownError),
        }
    }
}

/// Structured error carried over the wire in place of a serialized exception.
///
/// `{code: u32, messageLen: u32, message, causeLen: u32, cause}`
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: u32,
    pub message: String,
    pub cause: Option<Bytes>,
}

impl RemoteError {
    /// Raised by application code.
    pub const GENERIC: u32 = 1;
    /// The request could not be parsed.
    pub const MALFORMED: u32 = 2;
    /// The handler panicked.
    pub const PANIC: u32 = 3;
    /// The addressed node is not hosted here.
    pub const NO_SUCH_NODE: u32 = 4;
    /// The error envelope itself could not be decoded.
    pub const UNDECODABLE: u32 = u32::MAX;

    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), cause: None }
    }

    pub fn with_cause(mut self, cause: Bytes) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn encode(&self) -> Frame {
        let cause = self.cause.as_deref().unwrap_or(&[]);
        let mut buf = BytesMut::with_capacity(12 + self.message.len() + cause.len());
        buf.put_u32(self.code);
        buf.put_u32(self.message.len() as u32);
        buf.put_slice(self.message.as_bytes());
        buf.put_u32(cause.len() as u32);
        buf.put_slice(cause);
        buf.freeze()
    }

    fn try_decode(frame: &[u8]) -> Result<Self, ProtoError> {
        let code = read_u32(frame, 0, "error code")?;
        let msg_len = read_u32(frame, 4, "error message length")? as usize;
        let msg_end = 8 + msg_len;
        let msg = frame.get(8..msg_end).ok_or(ProtoError::Truncated {
            what: "error message",
            need: msg_end,
            have: frame.len(),
        })?;
        let message = std::str::from_utf8(msg)
            .map_err(|_| ProtoError::Malformed("error message is not utf-8".to_string()))?
            .to_string();
        let cause_len = read_u32(frame, msg_end, "error cause length")? as usize;
        let cause_end = msg_end + 4 + cause_len;
        if frame.len() != cause_end {
            return Err(ProtoError::Truncated { what: "error cause", need: cause_end, have: frame.len() });
        }
        let cause = if cause_len == 0 {
            None
        } else {
            Some(Bytes::copy_from_slice(&frame[msg_end + 4..cause_end]))
        };
        Ok(Self { code, message, cause })
    }

    /// Never fails: an undecodable envelope becomes a generic error wrapping the raw bytes.
    pub fn decode(frame: &[u8]) -> Self {
        match Self::try_decode(frame) {
            Ok(e) => e,
            Err(e) => Self::new(Self::UNDECODABLE, format!("undecodable remote error: {}", e))
                .with_cause(Bytes::copy_from_slice(frame)),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl fmt::Debug for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "RemoteError(code={}, message={:?}, cause={} bytes)",
            self.code,
            self.message,
            self.cause.as_ref().map(|c| c.len()).unwrap_or(0)
        )
    }
}

/// Decode a frame holding a UTF-8 address.
pub fn decode_address(frame: &[u8]) -> Result<String, ProtoError> {
    std::str::from_utf8(frame)
        .map(|s| s.to_string())
        .map_err(|_| ProtoError::Malformed("address is not utf-8".to_string()))
}

#[inline]
pub fn encode_u32(v: u32) -> Frame {
    u32_frame(v)
}

pub fn decode_u32(frame: &[u8], what: &'static str) -> Result<u32, ProtoError> {
    if frame.len() != 4 {
        return Err(ProtoError::Truncated { what, need: 4, have: frame.len() });
    }
    read_u32(frame, 0, what)
}
