//! fixed size frames exchanged between nodes.
//!
//! every packet travels as one 4100 byte frame: a u16 message code, a u16 error code and a 4096
//! byte payload area whose layout depends on the message code. integers are little endian, text
//! fields are NUL padded. the error code is always sent as zero and is not interpreted.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

pub const HEADER_LEN: usize = 4;
pub const PAYLOAD_LEN: usize = 4096;
pub const FRAME_LEN: usize = HEADER_LEN + PAYLOAD_LEN;

pub const MAX_DATA_LEN: usize = 2998;
pub const HASH_FIELD_LEN: usize = 64;
pub const IDENT_FIELD_LEN: usize = 1024;

pub mod msg_code {
    pub const ANNOUNCE: u16 = 0x02;
    pub const DISCONNECT: u16 = 0x03;
    pub const CHUNK_REQUEST: u16 = 0x06;
    pub const CHUNK_RESPONSE: u16 = 0x07;
    pub const ACKNOWLEDGE: u16 = 0x0c;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub offset: u32,
    pub data_len: u16,
    pub chunk_hash: String,
    pub ident: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResponse {
    pub offset: u32,
    pub data: Bytes,
    pub chunk_hash: String,
    pub ident: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Announce,
    Acknowledge,
    DisconnectNotice,
    ChunkRequest(ChunkRequest),
    ChunkResponse(ChunkResponse),
    /// a frame with a known code whose payload could not be read, kept so the connection can
    /// carry on past it.
    Malformed { code: u16, reason: &'static str },
    Unknown(u16),
}

impl Packet {
    pub fn code(&self) -> u16 {
        match self {
            Packet::Announce => msg_code::ANNOUNCE,
            Packet::Acknowledge => msg_code::ACKNOWLEDGE,
            Packet::DisconnectNotice => msg_code::DISCONNECT,
            Packet::ChunkRequest(_) => msg_code::CHUNK_REQUEST,
            Packet::ChunkResponse(_) => msg_code::CHUNK_RESPONSE,
            Packet::Malformed { code, .. } | Packet::Unknown(code) => *code,
        }
    }
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{field} is {len} bytes, the frame only has room for {max}")]
    Oversized {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type PeerFrames<T> = Framed<T, PacketCodec>;

pub fn upgrade_stream<T: PeerStream>(stream: T) -> PeerFrames<T> {
    Framed::with_capacity(stream, PacketCodec, FRAME_LEN)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PacketCodec;

fn take_text(payload: &mut Bytes, width: usize) -> Result<String, &'static str> {
    let field = payload.split_to(width);
    let end = field.iter().position(|&b| b == 0).unwrap_or(width);
    std::str::from_utf8(&field[..end])
        .map(str::to_string)
        .map_err(|_| "text field is not utf-8")
}

fn put_text(dst: &mut BytesMut, field: &'static str, text: &str, width: usize) -> Result<(), CodecError> {
    if text.len() > width {
        return Err(CodecError::Oversized {
            field,
            len: text.len(),
            max: width,
        });
    }
    dst.put_slice(text.as_bytes());
    dst.put_bytes(0, width - text.len());
    Ok(())
}

fn decode_request(mut payload: Bytes) -> Result<ChunkRequest, &'static str> {
    let offset = payload.get_u32_le();
    let data_len = payload.get_u16_le();
    let chunk_hash = take_text(&mut payload, HASH_FIELD_LEN)?;
    let ident = take_text(&mut payload, IDENT_FIELD_LEN)?;
    Ok(ChunkRequest {
        offset,
        data_len,
        chunk_hash,
        ident,
    })
}

fn decode_response(mut payload: Bytes) -> Result<ChunkResponse, &'static str> {
    let offset = payload.get_u32_le();
    let data_len = payload.get_u16_le() as usize;
    if data_len > MAX_DATA_LEN {
        return Err("data length exceeds the response data field");
    }
    let data = payload.split_to(MAX_DATA_LEN).split_to(data_len);
    let chunk_hash = take_text(&mut payload, HASH_FIELD_LEN)?;
    let ident = take_text(&mut payload, IDENT_FIELD_LEN)?;
    Ok(ChunkResponse {
        offset,
        data,
        chunk_hash,
        ident,
    })
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_LEN {
            src.reserve(FRAME_LEN - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(FRAME_LEN).freeze();
        let code = frame.get_u16_le();
        let _error = frame.get_u16_le();

        let packet = match code {
            msg_code::ANNOUNCE => Packet::Announce,
            msg_code::ACKNOWLEDGE => Packet::Acknowledge,
            msg_code::DISCONNECT => Packet::DisconnectNotice,
            msg_code::CHUNK_REQUEST => match decode_request(frame) {
                Ok(request) => Packet::ChunkRequest(request),
                Err(reason) => Packet::Malformed { code, reason },
            },
            msg_code::CHUNK_RESPONSE => match decode_response(frame) {
                Ok(response) => Packet::ChunkResponse(response),
                Err(reason) => Packet::Malformed { code, reason },
            },
            other => Packet::Unknown(other),
        };
        Ok(Some(packet))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.reserve(FRAME_LEN);
        dst.put_u16_le(item.code());
        dst.put_u16_le(0);

        let written = match item {
            Packet::ChunkRequest(request) => {
                dst.put_u32_le(request.offset);
                dst.put_u16_le(request.data_len);
                put_text(dst, "chunk hash", &request.chunk_hash, HASH_FIELD_LEN)
                    .and_then(|_| put_text(dst, "identifier", &request.ident, IDENT_FIELD_LEN))
            }
            Packet::ChunkResponse(response) => {
                if response.data.len() > MAX_DATA_LEN {
                    Err(CodecError::Oversized {
                        field: "chunk data",
                        len: response.data.len(),
                        max: MAX_DATA_LEN,
                    })
                } else {
                    dst.put_u32_le(response.offset);
                    dst.put_u16_le(response.data.len() as u16);
                    dst.put_slice(&response.data);
                    dst.put_bytes(0, MAX_DATA_LEN - response.data.len());
                    put_text(dst, "chunk hash", &response.chunk_hash, HASH_FIELD_LEN)
                        .and_then(|_| put_text(dst, "identifier", &response.ident, IDENT_FIELD_LEN))
                }
            }
            _ => Ok(()),
        };

        if let Err(err) = written {
            // never leave half a frame in the write buffer
            dst.truncate(start);
            return Err(err);
        }

        let padding = FRAME_LEN - (dst.len() - start);
        dst.put_bytes(0, padding);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use rstest::rstest;

    fn encode(packet: Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        PacketCodec.encode(packet, &mut buf).unwrap();
        buf
    }

    fn request() -> ChunkRequest {
        ChunkRequest {
            offset: 0x0102_0304,
            data_len: 4,
            chunk_hash: "ab".repeat(32),
            ident: "package-ident".into(),
        }
    }

    #[rstest]
    #[case(Packet::Announce, 0x02)]
    #[case(Packet::Acknowledge, 0x0c)]
    #[case(Packet::DisconnectNotice, 0x03)]
    fn control_frames_are_header_and_padding(#[case] packet: Packet, #[case] code: u8) {
        let buf = encode(packet);
        assert_eq!(buf.len(), FRAME_LEN);
        assert_eq!(&buf[..4], &[code, 0, 0, 0]);
        assert!(buf[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn request_layout() {
        let buf = encode(Packet::ChunkRequest(request()));
        assert_eq!(buf.len(), FRAME_LEN);
        assert_eq!(&buf[..10], &[0x06, 0, 0, 0, 0x04, 0x03, 0x02, 0x01, 4, 0]);
        assert_eq!(&buf[10..74], "ab".repeat(32).as_bytes());
        assert_eq!(&buf[74..87], b"package-ident");
        assert!(buf[87..].iter().all(|&b| b == 0));
    }

    #[test]
    fn response_layout() {
        let response = ChunkResponse {
            offset: 8,
            data: Bytes::from_static(b"XXXX"),
            chunk_hash: "cd".repeat(32),
            ident: "pkg".into(),
        };
        let buf = encode(Packet::ChunkResponse(response.clone()));
        assert_eq!(buf.len(), FRAME_LEN);
        assert_eq!(&buf[4..10], &[8, 0, 0, 0, 4, 0]);
        assert_eq!(&buf[10..14], b"XXXX");
        assert!(buf[14..3008].iter().all(|&b| b == 0));
        assert_eq!(&buf[3008..3072], "cd".repeat(32).as_bytes());
        assert_eq!(&buf[3072..3075], b"pkg");

        let mut buf = buf;
        assert_eq!(
            PacketCodec.decode(&mut buf).unwrap(),
            Some(Packet::ChunkResponse(response))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let full = encode(Packet::ChunkRequest(request()));
        let mut partial = BytesMut::from(&full[..FRAME_LEN - 1]);
        assert_eq!(PacketCodec.decode(&mut partial).unwrap(), None);
        partial.extend_from_slice(&full[FRAME_LEN - 1..]);
        assert_eq!(
            PacketCodec.decode(&mut partial).unwrap(),
            Some(Packet::ChunkRequest(request()))
        );
    }

    #[test]
    fn oversized_data_is_rejected_without_partial_output() {
        let mut buf = BytesMut::new();
        let err = PacketCodec
            .encode(
                Packet::ChunkResponse(ChunkResponse {
                    offset: 0,
                    data: Bytes::from(vec![1; MAX_DATA_LEN + 1]),
                    chunk_hash: String::new(),
                    ident: String::new(),
                }),
                &mut buf,
            )
            .unwrap_err();
        assert!(matches!(err, CodecError::Oversized { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn bad_payloads_decode_as_malformed() {
        let mut buf = encode(Packet::ChunkResponse(ChunkResponse {
            offset: 0,
            data: Bytes::new(),
            chunk_hash: String::new(),
            ident: String::new(),
        }));
        // claim more data than the field can hold
        buf[8..10].copy_from_slice(&3000u16.to_le_bytes());
        assert!(matches!(
            PacketCodec.decode(&mut buf).unwrap(),
            Some(Packet::Malformed { code: 0x07, .. })
        ));

        let mut buf = encode(Packet::ChunkRequest(request()));
        buf[74] = 0xff;
        assert!(matches!(
            PacketCodec.decode(&mut buf).unwrap(),
            Some(Packet::Malformed { code: 0x06, .. })
        ));
    }

    #[test]
    fn unknown_codes_survive_decoding() {
        let mut buf = BytesMut::zeroed(FRAME_LEN);
        buf[0] = 0xff;
        assert_eq!(
            PacketCodec.decode(&mut buf).unwrap(),
            Some(Packet::Unknown(0xff))
        );
    }

    #[tokio::test]
    async fn frames_over_a_duplex_stream() {
        let (client, server) = tokio::io::duplex(FRAME_LEN);
        let mut client = upgrade_stream(client);
        let mut server = upgrade_stream(server);

        let sender = tokio::spawn(async move {
            client.send(Packet::Announce).await.unwrap();
            client.send(Packet::ChunkRequest(request())).await.unwrap();
        });

        assert_eq!(server.next().await.unwrap().unwrap(), Packet::Announce);
        assert_eq!(
            server.next().await.unwrap().unwrap(),
            Packet::ChunkRequest(request())
        );
        sender.await.unwrap();
        assert!(server.next().await.is_none());
    }
}
