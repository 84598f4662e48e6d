//! Peer frame envelope.
//!
//! Wire layout, both directions:
//! `[primitive:1][info:1]([conn_id:2, big endian] if primitive < 0x80)[payload]`

use crate::codec::L3Codec;
use crate::error::FrameError;
use crate::pdu::Pdu;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

const CONN_ID_FLAG: u8 = 0x80;
const HEADER_LEN: usize = 2;
const CONN_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Primitive {
    L3Message,
    ConnLost,
    ConnRelease,
    StartMedia,
    StopMedia,
    AllocMedia,
    MediaError,
    MediaStarted,
    EstablishSapi,
    Handshake,
    RadioReady,
    StartPaging,
    StopPaging,
    Heartbeat,
    Unknown(u8),
}

impl Primitive {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Primitive::L3Message,
            1 => Primitive::ConnLost,
            2 => Primitive::ConnRelease,
            3 => Primitive::StartMedia,
            4 => Primitive::StopMedia,
            5 => Primitive::AllocMedia,
            6 => Primitive::MediaError,
            7 => Primitive::MediaStarted,
            8 => Primitive::EstablishSapi,
            128 => Primitive::Handshake,
            129 => Primitive::RadioReady,
            130 => Primitive::StartPaging,
            131 => Primitive::StopPaging,
            132 => Primitive::Heartbeat,
            other => Primitive::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Primitive::L3Message => 0,
            Primitive::ConnLost => 1,
            Primitive::ConnRelease => 2,
            Primitive::StartMedia => 3,
            Primitive::StopMedia => 4,
            Primitive::AllocMedia => 5,
            Primitive::MediaError => 6,
            Primitive::MediaStarted => 7,
            Primitive::EstablishSapi => 8,
            Primitive::Handshake => 128,
            Primitive::RadioReady => 129,
            Primitive::StartPaging => 130,
            Primitive::StopPaging => 131,
            Primitive::Heartbeat => 132,
            Primitive::Unknown(v) => v,
        }
    }

    /// Primitives below 0x80 address a single connection.
    pub fn has_conn_id(self) -> bool {
        self.code() & CONN_ID_FLAG == 0
    }

    pub fn name(self) -> &'static str {
        match self {
            Primitive::L3Message => "L3Message",
            Primitive::ConnLost => "ConnLost",
            Primitive::ConnRelease => "ConnRelease",
            Primitive::StartMedia => "StartMedia",
            Primitive::StopMedia => "StopMedia",
            Primitive::AllocMedia => "AllocMedia",
            Primitive::MediaError => "MediaError",
            Primitive::MediaStarted => "MediaStarted",
            Primitive::EstablishSapi => "EstablishSAPI",
            Primitive::Handshake => "Handshake",
            Primitive::RadioReady => "RadioReady",
            Primitive::StartPaging => "StartPaging",
            Primitive::StopPaging => "StopPaging",
            Primitive::Heartbeat => "Heartbeat",
            Primitive::Unknown(_) => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub primitive: Primitive,
    pub info: u8,
    pub conn_id: Option<u16>,
    pub pdu: Option<Pdu>,
    /// Textual payload of paging primitives.
    pub text: Option<String>,
    pub error: bool,
    pub reason: Option<String>,
    #[serde(with = "serde_bytes")]
    pub raw: Vec<u8>,
}

impl Message {
    pub fn new(primitive: Primitive, info: u8, conn_id: Option<u16>) -> Self {
        Self {
            primitive,
            info,
            conn_id,
            pdu: None,
            text: None,
            error: false,
            reason: None,
            raw: Vec::new(),
        }
    }

    pub fn l3(info: u8, conn_id: u16, pdu: Pdu) -> Self {
        let mut msg = Self::new(Primitive::L3Message, info, Some(conn_id));
        msg.pdu = Some(pdu);
        msg
    }

    pub fn signal(primitive: Primitive, info: u8) -> Self {
        Self::new(primitive, info, None)
    }

    pub fn paging(primitive: Primitive, info: u8, identity: &str) -> Self {
        let mut msg = Self::new(primitive, info, None);
        msg.text = Some(identity.to_string());
        msg
    }

    pub fn conn_id(&self) -> u16 {
        self.conn_id.unwrap_or(0)
    }

    /// Split a received frame.
    ///
    /// Payload decode failures do not reject the frame: the message is
    /// returned with `error` set and callers branch on it.
    pub fn parse(data: &[u8], codec: &dyn L3Codec) -> Result<Message, FrameError> {
        if data.len() < HEADER_LEN {
            return Err(FrameError::TooShort(data.len()));
        }
        let primitive = Primitive::from_u8(data[0]);
        let mut msg = Message::new(primitive, data[1], None);
        msg.raw = data.to_vec();
        let mut offset = HEADER_LEN;
        if primitive.has_conn_id() {
            if data.len() < CONN_HEADER_LEN {
                debug!("Received {} with missing connection id", primitive.name());
                return Err(FrameError::MissingConnId(primitive.code()));
            }
            msg.conn_id = Some(u16::from_be_bytes([data[2], data[3]]));
            offset = CONN_HEADER_LEN;
        }
        let payload = &data[offset..];
        match primitive {
            Primitive::L3Message => {
                trace!("Recv L3 message: {}", hex::encode(payload));
                match codec.decode(payload) {
                    Ok(pdu) => msg.pdu = Some(pdu),
                    Err(e) => msg.reason = Some(format!("Codec error: {e}")),
                }
            }
            Primitive::EstablishSapi
            | Primitive::Handshake
            | Primitive::RadioReady
            | Primitive::Heartbeat
            | Primitive::ConnLost
            | Primitive::MediaError
            | Primitive::MediaStarted => {}
            _ => msg.reason = Some("No decoder".to_string()),
        }
        if let Some(reason) = &msg.reason {
            debug!("Failed to parse {} ({}): {}", primitive.code(), primitive.name(), reason);
            msg.error = true;
        }
        Ok(msg)
    }

    /// Assemble the frame for this message.
    pub fn build(&self, codec: &dyn L3Codec) -> Result<Vec<u8>, FrameError> {
        let code = self.primitive.code();
        let mut buf = BytesMut::with_capacity(CONN_HEADER_LEN + 64);
        buf.put_u8(code);
        buf.put_u8(self.info);
        if self.primitive.has_conn_id() {
            buf.put_u16(self.conn_id());
        }
        match self.primitive {
            Primitive::L3Message => {
                let pdu = self.pdu.as_ref().ok_or(FrameError::EmptyPayload(code))?;
                let payload = codec.encode(pdu)?;
                if payload.is_empty() {
                    return Err(FrameError::EmptyPayload(code));
                }
                trace!("Send L3 message: {}", hex::encode(&payload));
                buf.put_slice(&payload);
            }
            Primitive::StartPaging | Primitive::StopPaging => {
                let text = self.text.as_deref().ok_or(FrameError::EmptyPayload(code))?;
                buf.put_slice(text.as_bytes());
            }
            Primitive::Heartbeat
            | Primitive::Handshake
            | Primitive::ConnRelease
            | Primitive::StartMedia
            | Primitive::StopMedia
            | Primitive::AllocMedia
            | Primitive::EstablishSapi => {}
            _ => return Err(FrameError::NoEncoder(code)),
        }
        Ok(buf.to_vec())
    }
}
