//! Identifiers of instances, nodes and channels.
//!
//! Every identifier has a fixed-length binary form so it can travel in a single
//! transport frame. String identifiers are turned into tokens with a name-based
//! UUID derivation, so the same string always yields the same token.

use crate::error::ProtoError;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Length of every binary token.
pub const TOKEN_LEN: usize = 16;

/// Length of the binary form of a [NodeId].
pub const NODE_ID_LEN: usize = TOKEN_LEN + 8 + 1;

const NAMESPACE_INSTANCE: Uuid = Uuid::NAMESPACE_OID;

// v5("occams-fabric/node") under the OID namespace
fn node_namespace() -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, b"occams-fabric/node")
}

fn channel_namespace() -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, b"occams-fabric/channel")
}

/// A physical cluster member.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId([u8; TOKEN_LEN]);

impl InstanceId {
    /// Derive the id of a named instance. Deterministic.
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&NAMESPACE_INSTANCE, name.as_bytes()).into_bytes())
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(buf: &[u8]) -> Result<Self, ProtoError> {
        let bytes: [u8; TOKEN_LEN] = buf
            .try_into()
            .map_err(|_| ProtoError::Truncated { what: "instance id", need: TOKEN_LEN, have: buf.len() })?;
        Ok(Self(bytes))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "instance({})", self)
    }
}

impl FromStr for InstanceId {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(|u| Self(u.into_bytes()))
            .map_err(|_| ProtoError::Malformed(format!("invalid instance id {:?}", s)))
    }
}

/// A logical endpoint hosted by exactly one instance.
///
/// The owning instance is part of the identity and never changes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    instance: InstanceId,
    local: u64,
    master: bool,
}

impl NodeId {
    pub fn new(instance: InstanceId, local: u64) -> Self {
        Self { instance, local, master: false }
    }

    pub fn master(instance: InstanceId, local: u64) -> Self {
        Self { instance, local, master: true }
    }

    #[inline]
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    #[inline]
    pub fn local(&self) -> u64 {
        self.local
    }

    #[inline]
    pub fn is_master(&self) -> bool {
        self.master
    }

    pub fn to_bytes(&self) -> [u8; NODE_ID_LEN] {
        let mut buf = [0u8; NODE_ID_LEN];
        buf[..TOKEN_LEN].copy_from_slice(self.instance.as_bytes());
        buf[TOKEN_LEN..TOKEN_LEN + 8].copy_from_slice(&self.local.to_be_bytes());
        buf[NODE_ID_LEN - 1] = self.master as u8;
        buf
    }

    pub fn from_slice(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() != NODE_ID_LEN {
            return Err(ProtoError::Truncated { what: "node id", need: NODE_ID_LEN, have: buf.len() });
        }
        let instance = InstanceId::from_slice(&buf[..TOKEN_LEN])?;
        let mut local = [0u8; 8];
        local.copy_from_slice(&buf[TOKEN_LEN..TOKEN_LEN + 8]);
        let master = match buf[NODE_ID_LEN - 1] {
            0 => false,
            1 => true,
            f => return Err(ProtoError::Malformed(format!("invalid master flag {}", f))),
        };
        Ok(Self { instance, local: u64::from_be_bytes(local), master })
    }

    /// The channel token the node is addressed by on the wire.
    pub fn token(&self) -> PeerToken {
        PeerToken(Uuid::new_v5(&node_namespace(), &self.to_bytes()).into_bytes())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.master {
            write!(f, "{}:{}:master", self.instance, self.local)
        } else {
            write!(f, "{}:{}", self.instance, self.local)
        }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "node({})", self)
    }
}

impl FromStr for NodeId {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let (Some(instance), Some(local)) = (parts.next(), parts.next()) else {
            return Err(ProtoError::Malformed(format!("invalid node id {:?}", s)));
        };
        let master = match parts.next() {
            None => false,
            Some("master") => true,
            Some(_) => return Err(ProtoError::Malformed(format!("invalid node id {:?}", s))),
        };
        if parts.next().is_some() {
            return Err(ProtoError::Malformed(format!("invalid node id {:?}", s)));
        }
        let local =
            local.parse().map_err(|_| ProtoError::Malformed(format!("invalid node id {:?}", s)))?;
        Ok(Self { instance: instance.parse()?, local, master })
    }
}

/// Names one logical channel: an inproc channel under a backend, or a pending
/// control request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerToken([u8; TOKEN_LEN]);

impl PeerToken {
    pub const NIL: PeerToken = PeerToken([0u8; TOKEN_LEN]);

    pub fn random() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&channel_namespace(), name.as_bytes()).into_bytes())
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(buf: &[u8]) -> Result<Self, ProtoError> {
        let bytes: [u8; TOKEN_LEN] = buf
            .try_into()
            .map_err(|_| ProtoError::Truncated { what: "peer token", need: TOKEN_LEN, have: buf.len() })?;
        Ok(Self(bytes))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; TOKEN_LEN]
    }
}

impl fmt::Display for PeerToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "token({})", self)
    }
}

/// A discovered path to a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub node: NodeId,
    /// Physical address of the node's bound endpoint.
    pub address: String,
    pub local: bool,
}

impl Route {
    pub fn new(node: NodeId, address: String, local_instance: InstanceId) -> Self {
        Self { node, address, local: node.instance() == local_instance }
    }
}

/// The inproc endpoint name of a channel opened under a backend.
///
/// The reactor binds it and the connection owner connects to it, both sides
/// derive the same name.
pub fn inproc_endpoint(address: &str, token: &PeerToken) -> String {
    format!("inproc://{}/{}", PeerToken::from_name(address), token)
}
