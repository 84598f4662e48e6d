//! SMS relay layer (RP) and transfer layer (TP) helpers.
//!
//! Only what the signalling engine needs: recognising RP message types,
//! extracting the submit destination and GSM 7-bit text of an MO message,
//! answering with RP-ACK/RP-ERROR and building an MT SMS-DELIVER.

use bytes::{BufMut, BytesMut};
use chrono::{Datelike, TimeZone, Timelike, Utc};
use thiserror::Error;

const BCD_ALPHABET: &[u8; 15] = b"0123456789*#ABC";
const MAX_RP_ADDR_LEN: usize = 11;
const MAX_TP_ADDR_LEN: usize = 12;
const MAX_RP_USER_DATA: usize = 232;

const TP_MTI_SUBMIT: u8 = 0x01;
const TP_UDHI: u8 = 0x40;
const TP_DELIVER_FIRST_OCTET: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpMessageType {
    DataFromMs,
    DataFromNetwork,
    AckFromMs,
    AckFromNetwork,
    ErrorFromMs,
    ErrorFromNetwork,
    SmmaFromMs,
    Reserved(u8),
}

impl RpMessageType {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x07 {
            0 => RpMessageType::DataFromMs,
            1 => RpMessageType::DataFromNetwork,
            2 => RpMessageType::AckFromMs,
            3 => RpMessageType::AckFromNetwork,
            4 => RpMessageType::ErrorFromMs,
            5 => RpMessageType::ErrorFromNetwork,
            6 => RpMessageType::SmmaFromMs,
            other => RpMessageType::Reserved(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            RpMessageType::DataFromMs => 0,
            RpMessageType::DataFromNetwork => 1,
            RpMessageType::AckFromMs => 2,
            RpMessageType::AckFromNetwork => 3,
            RpMessageType::ErrorFromMs => 4,
            RpMessageType::ErrorFromNetwork => 5,
            RpMessageType::SmmaFromMs => 6,
            RpMessageType::Reserved(v) => v,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpError {
    #[error("invalid hex string")]
    InvalidHex,
    #[error("missing message type or reference")]
    Truncated,
    #[error("{0}")]
    Build(&'static str),
}

const NUM_TYPES: [(&str, u8); 8] = [
    ("unknown", 0),
    ("international", 1),
    ("national", 2),
    ("network-specific", 3),
    ("dedicated-access", 4),
    ("reserved", 5),
    ("abbreviated", 6),
    ("extension-reserved", 7),
];

const NUM_PLANS: [(&str, u8); 8] = [
    ("unknown", 0),
    ("isdn", 1),
    ("data", 3),
    ("telex", 4),
    ("national", 8),
    ("private", 9),
    ("CTS-reserved", 11),
    ("extension-reserved", 15),
];

fn lookup_name(table: &[(&'static str, u8)], code: u8) -> &'static str {
    table.iter().find(|(_, c)| *c == code).map_or("", |(n, _)| n)
}

fn lookup_code(table: &[(&'static str, u8)], name: &str) -> u8 {
    table.iter().find(|(n, _)| *n == name).map_or(0, |(_, c)| *c)
}

/// Decoded BCD party number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartyNumber {
    pub digits: String,
    pub plan: String,
    pub nature: String,
}

fn decode_bcd(b: &[u8], ignore_last: bool) -> PartyNumber {
    let mut party = PartyNumber::default();
    let Some((&first, rest)) = b.split_first() else {
        return party;
    };
    party.plan = lookup_name(&NUM_PLANS, first & 0x0f).to_string();
    party.nature = lookup_name(&NUM_TYPES, (first & 0x70) >> 4).to_string();
    for (i, octet) in rest.iter().enumerate() {
        let lo = octet & 0x0f;
        if lo < 15 {
            party.digits.push(BCD_ALPHABET[lo as usize] as char);
        }
        if ignore_last && i + 1 == rest.len() {
            break;
        }
        let hi = octet >> 4;
        if hi < 15 {
            party.digits.push(BCD_ALPHABET[hi as usize] as char);
        }
    }
    party
}

fn bcd_index(c: u8) -> Option<u8> {
    BCD_ALPHABET.iter().position(|&x| x == c).map(|p| p as u8)
}

/// Encode the number octet and digits. Stops at the first invalid digit.
fn encode_bcd(digits: &str, plan: &str, nature: &str) -> Vec<u8> {
    let p = lookup_code(&NUM_PLANS, plan);
    let t = lookup_code(&NUM_TYPES, nature);
    let mut out = vec![0x80 | (p & 0x0f) | ((t & 0x03) << 4)];
    for pair in digits.as_bytes().chunks(2) {
        let Some(first) = bcd_index(pair[0]) else {
            break;
        };
        let second = match pair.get(1) {
            Some(&c) => match bcd_index(c) {
                Some(v) => v,
                None => break,
            },
            None => 15,
        };
        out.push((second << 4) | first);
    }
    out
}

/// What the engine extracts from an RPDU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpInfo {
    pub msg_type: u8,
    pub msg_ref: u8,
    /// RP destination (MO) or originator (MT) address.
    pub party: Option<PartyNumber>,
    /// TP destination address of an SMS-SUBMIT.
    pub sms_party: Option<PartyNumber>,
    pub text: Option<String>,
    pub text_encoding: Option<&'static str>,
    /// RP-Cause value of an RP-ERROR.
    pub cause: Option<u8>,
}

impl RpInfo {
    pub fn rp_type(&self) -> RpMessageType {
        RpMessageType::from_u8(self.msg_type)
    }
}

fn skip_lv(b: &mut &[u8]) {
    if b.is_empty() {
        return;
    }
    let skip = (b[0] as usize + 1).min(b.len());
    *b = &b[skip..];
}

/// Decode a hex RPDU.
pub fn decode_rp(rpdu: &str) -> Result<RpInfo, RpError> {
    let data = hex::decode(rpdu).map_err(|_| RpError::InvalidHex)?;
    if data.len() < 2 {
        return Err(RpError::Truncated);
    }
    let mut info = RpInfo {
        msg_type: data[0] & 0x07,
        msg_ref: data[1],
        ..RpInfo::default()
    };
    let rp_type = info.rp_type();
    if matches!(rp_type, RpMessageType::ErrorFromMs | RpMessageType::ErrorFromNetwork) {
        if data.len() > 3 && data[2] > 0 {
            info.cause = Some(data[3] & 0x7f);
        }
        return Ok(info);
    }
    if !matches!(rp_type, RpMessageType::DataFromMs | RpMessageType::DataFromNetwork) {
        return Ok(info);
    }
    let mut b = &data[2..];
    if rp_type == RpMessageType::DataFromMs {
        skip_lv(&mut b);
        if b.is_empty() {
            // no destination, the caller decides what to do without it
            return Ok(info);
        }
    }
    if let Some((&addr_len, rest)) = b.split_first() {
        let addr_len = addr_len as usize;
        b = rest;
        if addr_len > 0 {
            if addr_len <= b.len() {
                info.party = Some(decode_bcd(&b[..addr_len], false));
            }
            b = &b[addr_len.min(b.len())..];
        }
    }
    if rp_type == RpMessageType::DataFromNetwork {
        skip_lv(&mut b);
    }
    decode_tpdu(b, &mut info);
    Ok(info)
}

fn decode_tpdu(mut b: &[u8], info: &mut RpInfo) {
    // RP user data length, first octet
    if b.len() < 2 || b[0] as usize > b.len() - 1 {
        return;
    }
    let tp = b[1];
    b = &b[2..];
    if tp & 0x03 != TP_MTI_SUBMIT || b.len() < 2 {
        return;
    }
    // message reference
    b = &b[1..];
    if b.len() < 2 {
        return;
    }
    let digits = b[0] as usize;
    b = &b[1..];
    let mut l = 1 + (digits + 1) / 2;
    if l <= b.len() {
        info.sms_party = Some(decode_bcd(&b[..l], digits & 1 != 0));
    } else {
        l = b.len();
    }
    b = &b[l..];
    // protocol identifier
    if b.is_empty() {
        return;
    }
    b = &b[1..];
    // only the default alphabet is understood
    if b.is_empty() || b[0] != 0 {
        return;
    }
    b = &b[1..];
    if b.is_empty() {
        return;
    }
    let vp = (tp >> 3) & 0x03;
    if vp != 0 {
        let skip = if vp == 2 { 1 } else { 7 };
        b = &b[skip.min(b.len())..];
        if b.is_empty() {
            return;
        }
    }
    // TP-UDL counts septets
    let udl = b[0] as usize;
    b = &b[1..];
    if b.is_empty() || (udl * 7 + 7) / 8 > b.len() {
        return;
    }
    if tp & TP_UDHI != 0 {
        tracing::debug!("Can't decode SMS text with header");
        return;
    }
    let mut text = gsm7_unpack(b);
    if text.chars().count() > udl {
        text = text.chars().take(udl).collect();
    }
    info.text = Some(text);
    info.text_encoding = Some("gsm7bit");
}

pub fn rp_ack(msg_ref: u8) -> String {
    hex::encode([RpMessageType::AckFromNetwork.code(), msg_ref])
}

pub fn rp_error(msg_ref: u8, cause: u8) -> String {
    hex::encode([RpMessageType::ErrorFromNetwork.code(), msg_ref, 1, cause & 0x7f])
}

/// RP-ACK or, for non zero `cause`, RP-ERROR.
pub fn rp_response(msg_ref: u8, cause: u8) -> String {
    if cause == 0 {
        rp_ack(msg_ref)
    } else {
        rp_error(msg_ref, cause)
    }
}

/// Parameters of a network originated SMS-DELIVER.
#[derive(Debug, Clone, Default)]
pub struct MtDeliver<'a> {
    pub caller: &'a str,
    pub caller_plan: &'a str,
    pub caller_nature: &'a str,
    pub sms_caller: &'a str,
    pub sms_caller_plan: &'a str,
    pub sms_caller_nature: &'a str,
    pub text: &'a str,
    /// Service centre time stamp, seconds since the epoch.
    pub smsc_timestamp: i64,
    pub smsc_tz: u8,
}

fn semi_octet(value: u32) -> u8 {
    if value >= 100 {
        return 0;
    }
    (((value % 10) << 4) | (value / 10)) as u8
}

/// Build a hex RP-DATA (network to MS) carrying an SMS-DELIVER.
pub fn build_mt_deliver(p: &MtDeliver<'_>) -> Result<String, RpError> {
    if p.text.is_empty() {
        return Err(RpError::Build("empty text"));
    }
    let mut rp = BytesMut::with_capacity(256);
    rp.put_u8(RpMessageType::DataFromNetwork.code());
    rp.put_u8(0);
    // RP originator address, at least 2 octets
    let mut orig = encode_bcd(p.caller, p.caller_plan, p.caller_nature);
    if orig.len() > MAX_RP_ADDR_LEN {
        return Err(RpError::Build("invalid caller length"));
    }
    if orig.len() == 1 {
        orig.push(0xf0);
    }
    rp.put_u8(orig.len() as u8);
    rp.put_slice(&orig);
    // RP destination address
    rp.put_u8(0);

    let mut tpdu = BytesMut::with_capacity(200);
    let oa = encode_bcd(p.sms_caller, p.sms_caller_plan, p.sms_caller_nature);
    if oa.len() + 1 > MAX_TP_ADDR_LEN {
        return Err(RpError::Build("invalid SMS caller length"));
    }
    let mut digits = (oa.len() - 1) * 2;
    if oa.len() > 1 && oa[oa.len() - 1] & 0xf0 == 0xf0 {
        digits -= 1;
    }
    tpdu.put_u8(digits as u8);
    tpdu.put_slice(&oa);
    // PID, DCS
    tpdu.put_u8(0);
    tpdu.put_u8(0);
    let mut scts = [0u8; 7];
    if let Some(ts) = Utc.timestamp_opt(p.smsc_timestamp, 0).single() {
        scts[0] = semi_octet(ts.year().rem_euclid(100) as u32);
        scts[1] = semi_octet(ts.month());
        scts[2] = semi_octet(ts.day());
        scts[3] = semi_octet(ts.hour());
        scts[4] = semi_octet(ts.minute());
        scts[5] = semi_octet(ts.second());
    }
    scts[6] = p.smsc_tz;
    tpdu.put_slice(&scts);
    let (septets, packed) = gsm7_pack(p.text);
    if packed.is_empty() {
        return Err(RpError::Build("text leads to empty SMS content"));
    }
    tpdu.put_u8(septets as u8);
    tpdu.put_slice(&packed);

    let user_len = tpdu.len() + 1;
    if user_len > MAX_RP_USER_DATA {
        return Err(RpError::Build("RP-User-Data too long"));
    }
    rp.put_u8(user_len as u8);
    rp.put_u8(TP_DELIVER_FIRST_OCTET);
    rp.put_slice(&tpdu);
    Ok(hex::encode(&rp))
}

// GSM 03.38 default alphabet, '\u{a0}' marks the escape slot
const GSM7: [char; 128] = [
    '@', '£', '$', '¥', 'è', 'é', 'ù', 'ì', 'ò', 'Ç', '\n', 'Ø', 'ø', '\r', 'Å', 'å',
    'Δ', '_', 'Φ', 'Γ', 'Λ', 'Ω', 'Π', 'Ψ', 'Σ', 'Θ', 'Ξ', '\u{a0}', 'Æ', 'æ', 'ß', 'É',
    ' ', '!', '"', '#', '¤', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/',
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', ':', ';', '<', '=', '>', '?',
    '¡', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O',
    'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'Ä', 'Ö', 'Ñ', 'Ü', '§',
    '¿', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o',
    'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'ä', 'ö', 'ñ', 'ü', 'à',
];

fn gsm7_code(c: char) -> u8 {
    GSM7.iter().position(|&g| g == c).map_or(0x3f, |p| p as u8)
}

/// Pack text into GSM 7-bit septets. Returns the septet count and octets.
pub fn gsm7_pack(text: &str) -> (usize, Vec<u8>) {
    let septets: Vec<u8> = text.chars().map(gsm7_code).collect();
    let mut out = Vec::with_capacity(septets.len() * 7 / 8 + 1);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for s in &septets {
        acc |= u32::from(*s) << bits;
        bits += 7;
        while bits >= 8 {
            out.push((acc & 0xff) as u8);
            acc >>= 8;
            bits -= 8;
        }
    }
    if bits > 0 {
        out.push((acc & 0xff) as u8);
    }
    (septets.len(), out)
}

/// Unpack every septet held in `data`.
pub fn gsm7_unpack(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 8 / 7);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for octet in data {
        acc |= u32::from(*octet) << bits;
        bits += 8;
        while bits >= 7 {
            out.push(GSM7[(acc & 0x7f) as usize]);
            acc >>= 7;
            bits -= 7;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// RP-DATA MS->N submitting `text` to `dest` (unknown/isdn numbering).
    pub(crate) fn mo_rpdu(msg_ref: u8, dest: &str, text: &str) -> String {
        let (septets, packed) = gsm7_pack(text);
        let da = encode_bcd(dest, "isdn", "unknown");
        let mut tpdu = vec![0x01, 0x00, dest.len() as u8];
        tpdu.extend_from_slice(&da);
        tpdu.extend_from_slice(&[0x00, 0x00, septets as u8]);
        tpdu.extend_from_slice(&packed);
        let smsc = encode_bcd("4000", "isdn", "international");
        let mut rp = vec![0x00, msg_ref, 0x00, smsc.len() as u8];
        rp.extend_from_slice(&smsc);
        rp.push(tpdu.len() as u8);
        rp.extend_from_slice(&tpdu);
        hex::encode(rp)
    }

    #[test]
    fn test_gsm7_pack_known_vector() {
        // "hellohello" from GSM 03.38 examples
        let (n, packed) = gsm7_pack("hellohello");
        assert_eq!(n, 10);
        assert_eq!(hex::encode(&packed), "e8329bfd4697d9ec37");
        assert_eq!(&gsm7_unpack(&packed)[..10], "hellohello");
    }

    #[test]
    fn test_decode_mo_submit() {
        let info = decode_rp(&mo_rpdu(7, "1234", "hi")).unwrap();
        assert_eq!(info.rp_type(), RpMessageType::DataFromMs);
        assert_eq!(info.msg_ref, 7);
        let smsc = info.party.unwrap();
        assert_eq!(smsc.digits, "4000");
        assert_eq!(smsc.plan, "isdn");
        assert_eq!(smsc.nature, "international");
        assert_eq!(info.sms_party.unwrap().digits, "1234");
        assert_eq!(info.text.as_deref(), Some("hi"));
        assert_eq!(info.text_encoding, Some("gsm7bit"));
    }

    #[test]
    fn test_decode_text_longer_than_packed_octets() {
        let info = decode_rp(&mo_rpdu(1, "1234", "hello world")).unwrap();
        assert_eq!(info.text.as_deref(), Some("hello world"));
        // a user data length past the packed octets is not decoded
        let mut raw = hex::decode(mo_rpdu(1, "1234", "hello world")).unwrap();
        raw.truncate(raw.len() - 2);
        // RP user data length follows the 3 octet service centre address
        raw[7] = (raw.len() - 8) as u8;
        let info = decode_rp(&hex::encode(raw)).unwrap();
        assert!(info.text.is_none());
    }

    #[test]
    fn test_decode_odd_destination() {
        let info = decode_rp(&mo_rpdu(1, "12345", "ok")).unwrap();
        assert_eq!(info.sms_party.unwrap().digits, "12345");
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode_rp("zz"), Err(RpError::InvalidHex));
        assert_eq!(decode_rp("00"), Err(RpError::Truncated));
        // RP-DATA from MS with only an originator
        let bare = decode_rp("000100").unwrap();
        assert_eq!(bare.rp_type(), RpMessageType::DataFromMs);
        assert!(bare.party.is_none());
        let err = decode_rp("04070116").unwrap();
        assert_eq!(err.rp_type(), RpMessageType::ErrorFromMs);
        assert_eq!(err.cause, Some(22));
        assert_eq!(decode_rp("0407").unwrap().cause, None);
        let ack = decode_rp("0205").unwrap();
        assert_eq!(ack.rp_type(), RpMessageType::AckFromMs);
        assert!(ack.party.is_none());
    }

    #[test]
    fn test_rp_responses() {
        assert_eq!(rp_response(9, 0), "0309");
        assert_eq!(rp_response(9, 111), "0509016f");
        assert_eq!(rp_error(1, 0xff), "0501017f");
        assert_eq!(RpMessageType::ErrorFromNetwork.code(), 5);
    }

    #[test]
    fn test_bcd_number_octet() {
        let enc = encode_bcd("123", "isdn", "international");
        assert_eq!(enc, vec![0x91, 0x21, 0xf3]);
        let dec = decode_bcd(&enc, false);
        assert_eq!(dec.digits, "123");
        assert_eq!(dec.nature, "international");
    }

    #[test]
    fn test_build_mt_deliver() {
        let rpdu = build_mt_deliver(&MtDeliver {
            caller: "",
            sms_caller: "4321",
            text: "hi",
            smsc_timestamp: 1_700_000_000,
            ..MtDeliver::default()
        })
        .unwrap();
        let raw = hex::decode(&rpdu).unwrap();
        assert_eq!(raw[0], 1);
        // empty originator padded to two octets
        assert_eq!(&raw[2..5], &[2, 0x80, 0xf0]);
        assert_eq!(raw[5], 0);
        assert_eq!(raw[7], 0x04);
        // TP-OA digit count
        assert_eq!(raw[8], 4);
        // 2023-11-14 22:13:20 UTC, semi-octet swapped
        assert_eq!(&raw[14..20], &[0x32, 0x11, 0x41, 0x22, 0x31, 0x02]);
        assert_eq!(raw[21], 2);
        let info = decode_rp(&rpdu).unwrap();
        assert_eq!(info.rp_type(), RpMessageType::DataFromNetwork);
        assert_eq!(raw[6] as usize, raw.len() - 7);
    }

    #[test]
    fn test_build_mt_deliver_rejects_long_caller() {
        let err = build_mt_deliver(&MtDeliver {
            caller: "123456789012345678901234",
            text: "x",
            ..MtDeliver::default()
        });
        assert!(err.is_err());
    }
}
