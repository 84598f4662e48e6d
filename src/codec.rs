use crate::error::CodecError;
use crate::pdu::{Pdu, PROTOCOLS};

/// Octet codec for L3 protocol trees.
pub trait L3Codec: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<Pdu, CodecError>;
    fn encode(&self, pdu: &Pdu) -> Result<Vec<u8>, CodecError>;
}

/// Codec carrying the tree as JSON text.
///
/// Used by the daemon when the radio peer speaks the JSON rendition and by
/// every test scenario.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl L3Codec for JsonCodec {
    fn decode(&self, data: &[u8]) -> Result<Pdu, CodecError> {
        if data.is_empty() {
            return Err(CodecError::MsgTooShort);
        }
        let pdu: Pdu = serde_json::from_slice(data).map_err(|_| CodecError::ParserErr)?;
        if !PROTOCOLS.contains(&pdu.tag.as_str()) {
            return Err(CodecError::UnknownProto);
        }
        if pdu.message_type().is_none() {
            return Err(CodecError::UnknownMsgType);
        }
        Ok(pdu)
    }

    fn encode(&self, pdu: &Pdu) -> Result<Vec<u8>, CodecError> {
        if !PROTOCOLS.contains(&pdu.tag.as_str()) {
            return Err(CodecError::UnknownProto);
        }
        if pdu.message_type().is_none() {
            return Err(CodecError::MissingParam);
        }
        serde_json::to_vec(pdu).map_err(|_| CodecError::ParserErr)
    }
}
