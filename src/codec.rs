use bytes::{Buf, BytesMut};
use log::{error, trace};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    ber::{self, DEFAULT_MAX_PACKET_SIZE},
    error::Error,
    proto::LdapMessage,
};

pub struct LdapCodec {
    max_packet_size: usize,
}

impl LdapCodec {
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        LdapCodec { max_packet_size }
    }
}

impl Default for LdapCodec {
    fn default() -> Self {
        Self::with_max_packet_size(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl Decoder for LdapCodec {
    type Item = LdapMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let total = match ber::total_len(src, self.max_packet_size)? {
            Some(total) => total,
            None => {
                trace!("Incomplete packet, {} bytes buffered", src.len());
                return Ok(None);
            }
        };
        if src.len() < total {
            trace!("Incomplete packet, {} of {} bytes buffered", src.len(), total);
            return Ok(None);
        }
        let (packet, consumed) = ber::decode(&src[..total], self.max_packet_size).map_err(|e| {
            error!("Decoder error: {}", e);
            e
        })?;
        src.advance(consumed);
        trace!("Decoded message: {} bytes", consumed);
        LdapMessage::from_packet(packet).map(Some)
    }
}

impl Encoder<LdapMessage> for LdapCodec {
    type Error = Error;

    fn encode(&mut self, item: LdapMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        ber::encode_into(&item.to_packet(), dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ProtocolOp;

    #[test]
    fn test_decode_across_partial_feeds() {
        let msg = LdapMessage::new(7, ProtocolOp::UnbindRequest);
        let mut encoded = BytesMut::new();
        LdapCodec::default().encode(msg.clone(), &mut encoded).unwrap();

        let mut codec = LdapCodec::default();
        let mut buf = BytesMut::new();
        for (i, &b) in encoded.iter().enumerate() {
            buf.extend_from_slice(&[b]);
            let decoded = codec.decode(&mut buf).unwrap();
            if i + 1 < encoded.len() {
                assert!(decoded.is_none());
            } else {
                assert_eq!(decoded, Some(msg.clone()));
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_two_pipelined_messages() {
        let first = LdapMessage::new(1, ProtocolOp::DelRequest("cn=a,o=x".into()));
        let second = LdapMessage::new(2, ProtocolOp::UnbindRequest);
        let mut buf = BytesMut::new();
        let mut codec = LdapCodec::default();
        codec.encode(first.clone(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let msg = LdapMessage::new(1, ProtocolOp::DelRequest("x".repeat(64)));
        let mut buf = BytesMut::new();
        LdapCodec::default().encode(msg, &mut buf).unwrap();
        let mut codec = LdapCodec::with_max_packet_size(16);
        assert!(matches!(codec.decode(&mut buf), Err(Error::Ber(_))));
    }
}
