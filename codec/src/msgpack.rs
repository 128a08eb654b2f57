use crate::Codec;
use serde::{Deserialize, Serialize};

/// MessagePack codec, structs are encoded as maps so fields may be added later.
#[derive(Default, Clone, Copy, Debug)]
pub struct MsgpCodec();

impl Codec for MsgpCodec {
    #[inline]
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, ()> {
        match rmp_serde::encode::to_vec_named(msg) {
            Ok(buf) => Ok(buf),
            Err(e) => {
                warn!("msgpack encode error: {:?}", e);
                Err(())
            }
        }
    }

    #[inline]
    fn encode_into<T: Serialize>(&self, msg: &T, buf: &mut Vec<u8>) -> Result<usize, ()> {
        let pre_len = buf.len();
        if let Err(e) = rmp_serde::encode::write_named(buf, msg) {
            warn!("msgpack encode error: {:?}", e);
            return Err(());
        }
        Ok(buf.len() - pre_len)
    }

    #[inline]
    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()> {
        match rmp_serde::decode::from_slice(buf) {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!("msgpack decode error: {:?}", e);
                Err(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_derive::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Echo {
        seq: u64,
        msg: String,
    }

    #[test]
    fn test_encode_into_appends() {
        let codec = MsgpCodec::default();
        let mut buf = vec![0xffu8];
        let n = codec.encode_into(&Echo { seq: 1, msg: "hi".to_string() }, &mut buf).expect("encode");
        assert_eq!(buf.len(), n + 1);
        let back: Echo = codec.decode(&buf[1..]).expect("decode");
        assert_eq!(back, Echo { seq: 1, msg: "hi".to_string() });
    }

    #[test]
    fn test_decode_garbage() {
        let codec = MsgpCodec::default();
        assert!(codec.decode::<Echo>(&[0xc1]).is_err());
    }
}
