//! Wire framing for the control channel.
//!
//! Wire unit: `[4-byte big-endian length][1-byte type][JSON payload]`.
//! `length` covers the type byte plus the payload and is capped at
//! [`MAX_FRAME_SIZE`]. The codec is transport-agnostic: [`read_frame`] and
//! [`write_frame`] work over any `AsyncRead`/`AsyncWrite`, plain `TcpStream`
//! or `tokio_rustls`-wrapped TLS stream alike.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CoreError, Result};
use crate::headers::HeaderList;

/// Protocol version this build speaks. Echoed in `REGISTER_ACK`; a mismatch
/// on `REGISTER` yields `REGISTER_NACK{reason="version"}`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frames larger than this (type byte + payload) are rejected before the
/// payload is even read, so a hostile peer can't force an unbounded buffer.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameType {
    Register = 1,
    RegisterAck = 2,
    RegisterNack = 3,
    Heartbeat = 4,
    HeartbeatAck = 5,
    Request = 6,
    Response = 7,
    Error = 8,
    Close = 9,
}

impl FrameType {
    fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            1 => Self::Register,
            2 => Self::RegisterAck,
            3 => Self::RegisterNack,
            4 => Self::Heartbeat,
            5 => Self::HeartbeatAck,
            6 => Self::Request,
            7 => Self::Response,
            8 => Self::Error,
            9 => Self::Close,
            other => return Err(CoreError::UnknownFrameType(other)),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterPayload {
    pub subdomain: String,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterAckPayload {
    pub client_id: String,
    pub server_time: u64,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterNackPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub nonce: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestPayload {
    pub request_id: u64,
    pub method: String,
    pub path: String,
    pub headers: HeaderList,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponsePayload {
    pub request_id: u64,
    pub status_code: u16,
    #[serde(default)]
    pub reason: Option<String>,
    pub headers: HeaderList,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClosePayload {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Binary bodies through a text encoding: base64 in, raw bytes out.
mod body_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        base64::engine::general_purpose::STANDARD
            .encode(bytes)
            .serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// A single typed control-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Register(RegisterPayload),
    RegisterAck(RegisterAckPayload),
    RegisterNack(RegisterNackPayload),
    Heartbeat(HeartbeatPayload),
    HeartbeatAck(HeartbeatPayload),
    Request(RequestPayload),
    Response(ResponsePayload),
    Error(ErrorPayload),
    Close(ClosePayload),
}

impl Frame {
    fn frame_type(&self) -> FrameType {
        match self {
            Frame::Register(_) => FrameType::Register,
            Frame::RegisterAck(_) => FrameType::RegisterAck,
            Frame::RegisterNack(_) => FrameType::RegisterNack,
            Frame::Heartbeat(_) => FrameType::Heartbeat,
            Frame::HeartbeatAck(_) => FrameType::HeartbeatAck,
            Frame::Request(_) => FrameType::Request,
            Frame::Response(_) => FrameType::Response,
            Frame::Error(_) => FrameType::Error,
            Frame::Close(_) => FrameType::Close,
        }
    }

    fn payload_json(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Frame::Register(p) => serde_json::to_vec(p),
            Frame::RegisterAck(p) => serde_json::to_vec(p),
            Frame::RegisterNack(p) => serde_json::to_vec(p),
            Frame::Heartbeat(p) => serde_json::to_vec(p),
            Frame::HeartbeatAck(p) => serde_json::to_vec(p),
            Frame::Request(p) => serde_json::to_vec(p),
            Frame::Response(p) => serde_json::to_vec(p),
            Frame::Error(p) => serde_json::to_vec(p),
            Frame::Close(p) => serde_json::to_vec(p),
        }
    }

    fn decode_payload(ty: FrameType, payload: &[u8]) -> Result<Self> {
        let map_err = |e: serde_json::Error| CoreError::Decode(e.to_string());
        Ok(match ty {
            FrameType::Register => Frame::Register(serde_json::from_slice(payload).map_err(map_err)?),
            FrameType::RegisterAck => {
                Frame::RegisterAck(serde_json::from_slice(payload).map_err(map_err)?)
            }
            FrameType::RegisterNack => {
                Frame::RegisterNack(serde_json::from_slice(payload).map_err(map_err)?)
            }
            FrameType::Heartbeat => Frame::Heartbeat(serde_json::from_slice(payload).map_err(map_err)?),
            FrameType::HeartbeatAck => {
                Frame::HeartbeatAck(serde_json::from_slice(payload).map_err(map_err)?)
            }
            FrameType::Request => Frame::Request(serde_json::from_slice(payload).map_err(map_err)?),
            FrameType::Response => Frame::Response(serde_json::from_slice(payload).map_err(map_err)?),
            FrameType::Error => Frame::Error(serde_json::from_slice(payload).map_err(map_err)?),
            FrameType::Close => Frame::Close(serde_json::from_slice(payload).map_err(map_err)?),
        })
    }
}

/// Write one frame, atomically with respect to other frames on the same
/// stream as long as the caller serializes calls to `write_frame` itself
/// (one writer task/lock per connection — see `session.rs`/`connection.rs`).
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let payload = frame
        .payload_json()
        .map_err(|e| CoreError::Decode(e.to_string()))?;
    let len = payload.len() + 1;
    if len > MAX_FRAME_SIZE {
        return Err(CoreError::FrameTooLarge(len));
    }
    writer.write_u32(len as u32).await?;
    writer.write_u8(frame.frame_type() as u8).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, looping internally until the full length is obtained.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let len = reader.read_u32().await? as usize;
    if len == 0 {
        return Err(CoreError::Decode("zero-length frame".into()));
    }
    if len > MAX_FRAME_SIZE {
        return Err(CoreError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let ty = FrameType::from_byte(buf[0])?;
    Frame::decode_payload(ty, &buf[1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let mut buf = Vec::new();
            write_frame(&mut buf, &frame).await.unwrap();
            let mut cursor = std::io::Cursor::new(buf);
            let decoded = read_frame(&mut cursor).await.unwrap();
            assert_eq!(decoded, frame);
        });
    }

    #[test]
    fn register_roundtrip() {
        roundtrip(Frame::Register(RegisterPayload {
            subdomain: "p".into(),
            protocol_version: PROTOCOL_VERSION,
        }));
    }

    #[test]
    fn request_with_binary_body_roundtrip() {
        let mut headers = HeaderList::new();
        headers.push("X-Test", "1");
        headers.push("X-Test", "2");
        roundtrip(Frame::Request(RequestPayload {
            request_id: 42,
            method: "POST".into(),
            path: "/hello?x=1".into(),
            headers,
            body: vec![0, 159, 146, 150, 255],
        }));
    }

    #[test]
    fn response_empty_body_roundtrip() {
        roundtrip(Frame::Response(ResponsePayload {
            request_id: 7,
            status_code: 204,
            reason: None,
            headers: HeaderList::new(),
            body: Vec::new(),
        }));
    }

    #[test]
    fn close_roundtrip() {
        roundtrip(Frame::Close(ClosePayload {
            reason: Some("shutdown".into()),
        }));
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, CoreError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn unknown_frame_type_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.push(200); // not a valid FrameType
        buf.extend_from_slice(b"{}");
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, CoreError::UnknownFrameType(200)));
    }

    #[tokio::test]
    async fn partial_reads_are_assembled() {
        use tokio::io::AsyncWriteExt;
        let frame = Frame::Heartbeat(HeartbeatPayload {
            nonce: 1,
            timestamp: 1000,
        });
        let mut encoded = Vec::new();
        write_frame(&mut encoded, &frame).await.unwrap();

        // Feed the reader in 3-byte chunks via a duplex pipe to exercise read_exact looping.
        let (mut client, mut server) = tokio::io::duplex(4096);
        let writer_task = tokio::spawn(async move {
            for chunk in encoded.chunks(3) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });
        let decoded = read_frame(&mut server).await.unwrap();
        writer_task.await.unwrap();
        assert_eq!(decoded, frame);
    }
}
