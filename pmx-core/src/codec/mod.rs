//! `tokio_util` codec turning the pipe byte stream into [`Message`]s.
//!
//! Any decode error is fatal: once a frame is rejected the stream is no
//! longer synchronised and the connection must be closed.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::PmxError;
use crate::header::{FrameHeader, FrameHeaderBytes, HEADER_SIZE};
use crate::message::Message;

/// Frame codec for PMX pipes.
#[derive(Debug, Default, Clone, Copy)]
pub struct PmxCodec;

impl Decoder for PmxCodec {
    type Item = Message;
    type Error = PmxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut raw: FrameHeaderBytes = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&src[..HEADER_SIZE]);
        let header = FrameHeader::from_bytes(&raw)?;

        let payload_len = header.payload_length as usize;
        if payload_len > crate::MAX_PAYLOAD_SIZE {
            return Err(PmxError::Protocol(format!(
                "frame payload of {payload_len} bytes exceeds {}",
                crate::MAX_PAYLOAD_SIZE
            )));
        }

        if src.len() < HEADER_SIZE + payload_len {
            src.reserve(HEADER_SIZE + payload_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(payload_len);
        header.verify(&payload)?;

        Message::decode(&header, &payload).map(Some)
    }
}

impl Encoder<Message> for PmxCodec {
    type Error = PmxError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (header, payload) = item.encode()?;
        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::ProtocolFlags;
    use crate::log::{LogLevel, LogRecord};
    use crate::message::{CorrelationId, RejectKind, ResponseStatus};

    fn encode(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        PmxCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn every_variant_survives_the_wire() {
        let id = CorrelationId::new();
        let messages = vec![
            Message::ConnectRequest {
                id,
                description: "ops console on build-03".into(),
            },
            Message::CommandRequest {
                id,
                command_line: "list --all".into(),
            },
            Message::CancelRequest {
                id: CorrelationId::new(),
                target: id,
            },
            Message::DisconnectRequest { id },
            Message::ConnectResponse { id },
            Message::CommandResponse {
                id,
                chunks: vec![],
                status: ResponseStatus::Completed,
            },
            Message::ErrorResponse {
                id,
                kind: RejectKind::DuplicateRequest,
                message: "already running".into(),
            },
            Message::LogResponse {
                log: LogRecord::new(LogLevel::Info, "host", "started"),
            },
            Message::DisconnectResponse {
                reason: "server shutting down".into(),
            },
        ];

        // Decode them back-to-back from one buffer, the way a pipe delivers them.
        let mut buf = BytesMut::new();
        for msg in &messages {
            PmxCodec.encode(msg.clone(), &mut buf).unwrap();
        }
        for expected in messages {
            let decoded = PmxCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, expected);
            assert_eq!(decoded.correlation_id(), expected.correlation_id());
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let full = encode(Message::CommandRequest {
            id: CorrelationId::new(),
            command_line: "status".into(),
        });

        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(PmxCodec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 3..]);
        assert!(PmxCodec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn unknown_discriminator_is_fatal() {
        let header =
            FrameHeader::for_payload(0x4242, ProtocolFlags::NONE, CorrelationId::new(), &[])
                .unwrap();
        let mut buf = BytesMut::from(&header.to_bytes()[..]);
        assert!(matches!(
            PmxCodec.decode(&mut buf),
            Err(PmxError::Protocol(_))
        ));
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut buf = encode(Message::CommandRequest {
            id: CorrelationId::new(),
            command_line: "echo hi".into(),
        });
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert!(matches!(
            PmxCodec.decode(&mut buf),
            Err(PmxError::Protocol(_))
        ));
    }

    #[test]
    fn oversized_declared_length_is_rejected_before_buffering() {
        let mut header =
            FrameHeader::for_payload(0x02, ProtocolFlags::NONE, CorrelationId::new(), &[])
                .unwrap();
        header.payload_length = (crate::MAX_PAYLOAD_SIZE + 1) as u32;
        let mut buf = BytesMut::from(&header.to_bytes()[..]);
        assert!(PmxCodec.decode(&mut buf).is_err());
    }
}
