//! Multi-part messages and their transport envelopes.
//!
//! An envelope is every leading frame of a message up to and including the first
//! empty delimiter frame. Routers push the identity of the sender onto the front,
//! so a server must keep the envelope and put it back on the reply.

use crate::error::ProtoError;
use bytes::Bytes;

/// One part of a multi-part message.
pub type Frame = Bytes;

/// A multi-part message.
pub type Message = Vec<Frame>;

/// The empty delimiter frame.
#[inline]
pub fn delimiter() -> Frame {
    Bytes::new()
}

/// Leading address frames of a message, delimiter included.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Envelope(Vec<Frame>);

impl Envelope {
    /// An envelope made of the given address frames and a delimiter.
    pub fn new(addresses: impl IntoIterator<Item = Frame>) -> Self {
        let mut frames: Vec<Frame> = addresses.into_iter().collect();
        frames.push(delimiter());
        Self(frames)
    }

    /// Address frames, delimiter excluded.
    #[inline]
    pub fn addresses(&self) -> &[Frame] {
        match self.0.split_last() {
            Some((_, addr)) => addr,
            None => &[],
        }
    }

    /// The innermost address frame, the one closest to the delimiter.
    #[inline]
    pub fn last_address(&self) -> Option<&Frame> {
        self.addresses().last()
    }

    #[inline]
    pub fn frames(&self) -> &[Frame] {
        &self.0
    }
}

/// Remove every leading frame up to and including the first empty frame.
pub fn split_envelope(mut msg: Message) -> Result<(Envelope, Message), ProtoError> {
    let Some(pos) = msg.iter().position(|f| f.is_empty()) else {
        return Err(ProtoError::Malformed("message without envelope delimiter".to_string()));
    };
    let body = msg.split_off(pos + 1);
    Ok((Envelope(msg), body))
}

/// Prepend the envelope back onto a message body.
pub fn restore_envelope(envelope: Envelope, body: Message) -> Message {
    let mut msg = envelope.0;
    msg.reserve(body.len());
    msg.extend(body);
    msg
}

/// Total payload size of a message, used in logs and size checks.
#[inline]
pub fn message_size(msg: &[Frame]) -> usize {
    msg.iter().map(|f| f.len()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(parts: &[&'static [u8]]) -> Message {
        parts.iter().map(|p| Bytes::from_static(p)).collect()
    }

    #[test]
    fn test_split_restore_is_identity() {
        let msg = frames(&[b"a1", b"a2", b"", b"p1", b"p2"]);
        let (env, body) = split_envelope(msg.clone()).expect("split");
        assert_eq!(env.addresses().len(), 2);
        assert_eq!(env.last_address().map(|f| f.as_ref()), Some(&b"a2"[..]));
        assert_eq!(body, frames(&[b"p1", b"p2"]));
        assert_eq!(restore_envelope(env, body), msg);
    }

    #[test]
    fn test_split_only_first_delimiter() {
        let msg = frames(&[b"a1", b"", b"p1", b"", b"p2"]);
        let (env, body) = split_envelope(msg.clone()).expect("split");
        assert_eq!(env.frames().len(), 2);
        assert_eq!(body.len(), 3);
        assert_eq!(restore_envelope(env, body), msg);
    }

    #[test]
    fn test_split_bare_delimiter() {
        let msg = frames(&[b"", b"p1"]);
        let (env, body) = split_envelope(msg.clone()).expect("split");
        assert!(env.addresses().is_empty());
        assert_eq!(restore_envelope(env, body), msg);
    }

    #[test]
    fn test_split_without_delimiter_is_malformed() {
        let msg = frames(&[b"a1", b"p1"]);
        assert!(matches!(split_envelope(msg), Err(ProtoError::Malformed(_))));
    }

    #[test]
    fn test_envelope_new() {
        let env = Envelope::new([Bytes::from_static(b"id")]);
        let msg = restore_envelope(env.clone(), frames(&[b"x"]));
        assert_eq!(msg, frames(&[b"id", b"", b"x"]));
        assert_eq!(message_size(&msg), 3);
    }
}
