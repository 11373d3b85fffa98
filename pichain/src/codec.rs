//! # Summary
//!
//! This module implements the peer wire codec: frames are
//! `(1-byte tag)(4-byte big-endian length)(payload)`, where `payload`
//! begins with a 1-byte version (currently `0x01`) followed by a
//! bincode-encoded body using big-endian integers. `bytes::BytesMut`-based
//! buffering follows the usual `tokio_util::codec::{Encoder, Decoder}`
//! shape; the header is hand-rolled rather than delegated to
//! `tokio_util::codec::LengthDelimitedCodec` because the wire format is
//! more specific than a bare length prefix.

use bincode::Options;
use bytes::{Buf, BufMut, BytesMut};
use byteorder::{BigEndian, ByteOrder};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{
    Accept, Accepted, BackfillRequest, BackfillResponse, Ballot, Decide, Nack, PValue,
    PeerMessage, Prepare, Promise, Transaction,
};

/// Current wire version. Bumped whenever the payload encoding changes in
/// a way that isn't backward compatible.
pub const WIRE_VERSION: u8 = 0x01;

const HEADER_LEN: usize = 1 /* tag */ + 4 /* length */;

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed payload: {0}")]
    Decode(#[from] bincode::Error),
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
}

fn bincode_options() -> impl bincode::Options {
    bincode::options().with_big_endian().with_fixint_encoding()
}

/// `Decoder`/`Encoder` for `PeerMessage`, used for both directions of a
/// peer-to-peer TCP connection.
#[derive(Default)]
pub struct PeerCodec;

impl Encoder<PeerMessage> for PeerCodec {
    type Error = CodecError;

    fn encode(&mut self, message: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let tag = message.tag();
        let mut payload = Vec::with_capacity(64);
        payload.push(WIRE_VERSION);
        encode_body(&message, &mut payload)?;

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(tag);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = PeerMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let tag = src[0];
        let len = BigEndian::read_u32(&src[1..5]) as usize;
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len);
        if payload.is_empty() || payload[0] != WIRE_VERSION {
            return Err(CodecError::UnsupportedVersion(payload.first().copied().unwrap_or(0)));
        }
        decode_body(tag, &payload[1..]).map(Some)
    }
}

fn encode_body(message: &PeerMessage, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let options = bincode_options();
    match message {
        PeerMessage::Txn(txn) => out.extend(options.serialize(txn)?),
        PeerMessage::Block(block) => out.extend(options.serialize(block)?),
        PeerMessage::Prepare(p) => out.extend(options.serialize(p)?),
        PeerMessage::Promise(p) => out.extend(options.serialize(p)?),
        PeerMessage::Accept(p) => out.extend(options.serialize(p)?),
        PeerMessage::Accepted(p) => out.extend(options.serialize(p)?),
        PeerMessage::Nack(p) => out.extend(options.serialize(p)?),
        PeerMessage::Decide(p) => out.extend(options.serialize(p)?),
        PeerMessage::Ping(id) => out.extend(options.serialize(id)?),
        PeerMessage::BackfillRequest(p) => out.extend(options.serialize(p)?),
        PeerMessage::BackfillResponse(p) => out.extend(options.serialize(p)?),
    }
    Ok(())
}

fn decode_body(tag: u8, bytes: &[u8]) -> Result<PeerMessage, CodecError> {
    let options = bincode_options();
    Ok(match tag {
        0 => PeerMessage::Txn(options.deserialize::<Transaction>(bytes)?),
        1 => PeerMessage::Block(options.deserialize::<crate::chain::Block>(bytes)?),
        2 => PeerMessage::Prepare(options.deserialize::<Prepare>(bytes)?),
        3 => PeerMessage::Promise(options.deserialize::<Promise>(bytes)?),
        4 => PeerMessage::Accept(options.deserialize::<Accept>(bytes)?),
        5 => PeerMessage::Accepted(options.deserialize::<Accepted>(bytes)?),
        6 => PeerMessage::Nack(options.deserialize::<Nack>(bytes)?),
        7 => PeerMessage::Decide(options.deserialize::<Decide>(bytes)?),
        8 => PeerMessage::Ping(options.deserialize::<usize>(bytes)?),
        9 => PeerMessage::BackfillRequest(options.deserialize::<BackfillRequest>(bytes)?),
        10 => PeerMessage::BackfillResponse(options.deserialize::<BackfillResponse>(bytes)?),
        other => return Err(CodecError::UnknownTag(other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Block;

    #[test]
    fn round_trips_every_variant() {
        let block = Block::genesis();
        let messages = vec![
            PeerMessage::Txn(Transaction { creator: 1, payload: b"k v".to_vec(), client_seq: 1 }),
            PeerMessage::Block(block.clone()),
            PeerMessage::Prepare(Prepare { depth: 1, ballot: Ballot { round: 1, proposer: 0 } }),
            PeerMessage::Promise(Promise {
                acceptor: 0,
                depth: 1,
                ballot: Ballot { round: 1, proposer: 0 },
                accepted: Some(PValue { depth: 1, ballot: Ballot { round: 1, proposer: 0 }, block: block.clone() }),
            }),
            PeerMessage::Nack(Nack { depth: 1, highest_promised: Ballot { round: 2, proposer: 1 } }),
            PeerMessage::Ping(3),
            PeerMessage::BackfillRequest(BackfillRequest { missing: block.block_id(), have: block.block_id() }),
            PeerMessage::BackfillResponse(BackfillResponse { blocks: vec![block.clone()] }),
        ];

        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        for message in &messages {
            codec.encode(message.clone(), &mut buf).unwrap();
        }

        let mut decoded = Vec::new();
        while let Some(message) = codec.decode(&mut buf).unwrap() {
            decoded.push(message);
        }
        assert_eq!(decoded.len(), messages.len());
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(PeerMessage::Ping(1), &mut buf)
            .unwrap();
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }
}
