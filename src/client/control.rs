//! Issuing control requests to other instances.
//!
//! A request goes out on the backend of the target's control address, framed as
//! `[token][delimiter][Preamble][frames...]`. The token is fresh per request: the reply
//! carries it back, finds no inproc channel and lands in the pending table of
//! [FabricState](crate::state::FabricState).

use crate::state::{FabricState, Pending, PendingReply};
use bytes::Bytes;
use occams_fabric_core::envelope::delimiter;
use occams_fabric_core::error::{FabricError, InvokeError, ProtoError, TransportError};
use occams_fabric_core::proto::{
    CommandType, Preamble, RemoteError, RequestHeader, ResponseCode, ResponseHeader, ResponseKind, decode_address,
    decode_u32,
};
use occams_fabric_core::{Frame, InstanceId, Message, NodeId, PeerToken};
use occams_fabric_stream::ReactorHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// A decoded control response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlReply {
    pub code: ResponseCode,
    pub frames: Message,
}

impl ControlReply {
    pub fn decode(mut msg: Message) -> Result<Self, ProtoError> {
        if msg.is_empty() {
            return Err(ProtoError::Malformed("empty control reply".to_string()));
        }
        let frames = msg.split_off(1);
        Ok(Self { code: ResponseCode::decode(&msg[0])?, frames })
    }

    /// The frames of an `OK` reply, otherwise the error the code stands for.
    pub fn into_result(self) -> Result<Message, FabricError> {
        self.code.into_result(self.frames)
    }
}

#[derive(Clone)]
pub struct ControlClient {
    reactor: ReactorHandle<FabricState>,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(reactor: ReactorHandle<FabricState>, timeout: Duration) -> Self {
        Self { reactor, timeout }
    }

    /// Send one request to the control channel at `address` and wait for the reply.
    pub async fn request(&self, address: &str, preamble: Preamble, args: Vec<Frame>) -> Result<ControlReply, FabricError> {
        let token = PeerToken::random();
        let (tx, rx) = oneshot::channel();
        self.post(address, token, preamble, args, PendingReply::Once(tx)).await?;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(msg))) => Ok(ControlReply::decode(msg)?),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(_)) => Err(FabricError::Shutdown),
            Err(_) => {
                self.forget(token);
                Err(FabricError::Timeout)
            }
        }
    }

    async fn post(
        &self, address: &str, token: PeerToken, preamble: Preamble, args: Vec<Frame>, reply: PendingReply,
    ) -> Result<(), FabricError> {
        let mut msg = Vec::with_capacity(args.len() + 3);
        msg.push(Bytes::copy_from_slice(token.as_bytes()));
        msg.push(delimiter());
        msg.push(preamble.encode());
        msg.extend(args);
        let address = address.to_string();
        self.reactor
            .query(move |r| -> Result<(), FabricError> {
                let backend = r.open_backend(&address)?;
                r.state.pending.insert(token, Pending { address: address.clone(), reply });
                if r.send(backend, msg) {
                    Ok(())
                } else {
                    r.state.pending.remove(&token);
                    Err(TransportError::HostUnreachable(address).into())
                }
            })
            .await?
    }

    fn forget(&self, token: PeerToken) {
        let _ = self.reactor.execute(move |r| {
            r.state.pending.remove(&token);
        });
    }

    async fn command(&self, address: &str, cmd: CommandType, args: Vec<Frame>) -> Result<Message, FabricError> {
        self.request(address, Preamble::new(cmd), args).await?.into_result()
    }

    /// The instance behind `address` and the nodes it hosts.
    pub async fn get_instance_status(&self, address: &str) -> Result<(InstanceId, Vec<NodeId>), FabricError> {
        let frames = self.command(address, CommandType::GetInstanceStatus, Vec::new()).await?;
        let Some((instance, nodes)) = frames.split_first() else {
            return Err(ProtoError::Malformed("instance status without instance".to_string()).into());
        };
        let instance = InstanceId::from_slice(instance)?;
        let nodes = nodes.iter().map(|f| NodeId::from_slice(f)).collect::<Result<Vec<_>, _>>()?;
        Ok((instance, nodes))
    }

    /// Ask the owner of `node` to bind it for `caller_address`, returning the bind address.
    pub async fn open_route_to_node(&self, address: &str, node: NodeId, caller_address: &str) -> Result<String, FabricError> {
        let args = vec![Bytes::copy_from_slice(&node.to_bytes()), Bytes::copy_from_slice(caller_address.as_bytes())];
        let frames = self.command(address, CommandType::OpenRouteToNode, args).await?;
        first_address(&frames)
    }

    pub async fn open_binding(&self, address: &str, node: NodeId) -> Result<String, FabricError> {
        let args = vec![Bytes::copy_from_slice(&node.to_bytes())];
        let frames = self.command(address, CommandType::OpenBindingForNode, args).await?;
        first_address(&frames)
    }

    pub async fn close_binding(&self, address: &str, node: NodeId) -> Result<(), FabricError> {
        let args = vec![Bytes::copy_from_slice(&node.to_bytes())];
        self.command(address, CommandType::CloseBindingForNode, args).await.map(|_| ())
    }

    /// False when the instance at `address` had no such route.
    pub async fn close_route_to_node(
        &self, address: &str, node: NodeId, caller_address: Option<&str>,
    ) -> Result<bool, FabricError> {
        let mut args = vec![Bytes::copy_from_slice(&node.to_bytes())];
        if let Some(caller) = caller_address {
            args.push(Bytes::copy_from_slice(caller.as_bytes()));
        }
        let reply = self.request(address, Preamble::new(CommandType::CloseRouteToNode), args).await?;
        if matches!(reply.code, ResponseCode::NoSuchRoute(_)) {
            return Ok(false);
        }
        reply.into_result().map(|_| true)
    }

    /// How many routes the instance at `address` dropped.
    pub async fn close_routes_via_instance(&self, address: &str, instance: InstanceId) -> Result<u32, FabricError> {
        let args = vec![Bytes::copy_from_slice(instance.as_bytes())];
        let frames = self.command(address, CommandType::CloseRoutesViaInstance, args).await?;
        match frames.first() {
            Some(f) => Ok(decode_u32(f, "route count")?),
            None => Err(ProtoError::Malformed("route count missing".to_string()).into()),
        }
    }

    /// Invoke `node` through the control channel of its instance.
    ///
    /// Returns the synchronous part followed by the `additional_parts` callback parts,
    /// in part order.
    pub async fn forward(
        &self, address: &str, node: NodeId, payload: Bytes, additional_parts: u32,
    ) -> Result<Vec<Result<Bytes, InvokeError>>, FabricError> {
        let token = PeerToken::random();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let args = vec![
            Bytes::copy_from_slice(&node.to_bytes()),
            RequestHeader { additional_parts }.encode(),
            payload,
        ];
        self.post(address, token, Preamble::new(CommandType::Forward), args, PendingReply::Stream(tx)).await?;
        let expect = additional_parts as usize + 1;
        let mut parts: Vec<Option<Result<Bytes, InvokeError>>> = vec![None; expect];
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut received = 0;
        let result = loop {
            if received == expect {
                break Ok(parts.into_iter().flatten().collect());
            }
            let msg = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => break Err(TransportError::Closed.into()),
                Err(_) => break Err(FabricError::Timeout),
            };
            let (header, payload) = match forwarded_part(msg) {
                Ok(part) => part,
                Err(e) => break Err(e),
            };
            let Some(slot) = parts.get_mut(header.part as usize) else {
                warn!("forwarded part {} out of range, ignored", header.part);
                continue;
            };
            if slot.is_some() {
                continue;
            }
            *slot = Some(match header.kind {
                ResponseKind::Result => Ok(payload),
                ResponseKind::Error => Err(InvokeError::Remote(RemoteError::decode(&payload))),
            });
            received += 1;
        };
        self.forget(token);
        result
    }
}

/// `[ResponseCode][ResponseHeader][payload]`
fn forwarded_part(msg: Message) -> Result<(ResponseHeader, Bytes), FabricError> {
    let frames = ControlReply::decode(msg)?.into_result()?;
    let [header, payload] = <[Frame; 2]>::try_from(frames)
        .map_err(|f| ProtoError::Malformed(format!("forwarded part of {} frames", f.len())))?;
    Ok((ResponseHeader::decode(&header)?, payload))
}

fn first_address(frames: &[Frame]) -> Result<String, FabricError> {
    match frames.first() {
        Some(f) => Ok(decode_address(f)?),
        None => Err(ProtoError::Malformed("reply without address".to_string()).into()),
    }
}
