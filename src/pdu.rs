//! Decoded L3 protocol tree.
//!
//! A [`Pdu`] is the structured form handed over by the L3 codec: a root
//! element tagged with the protocol ("MM", "CC", "SMS", "SS", "RRM"), an
//! optional `TID` child for transaction based protocols and a `Message`
//! child whose `type` attribute names the message. Information elements are
//! children of the `Message` element.

use serde::{Deserialize, Serialize};

pub const PROTO_MM: &str = "MM";
pub const PROTO_CC: &str = "CC";
pub const PROTO_SMS: &str = "SMS";
pub const PROTO_SS: &str = "SS";
pub const PROTO_RRM: &str = "RRM";

pub const PROTOCOLS: [&str; 5] = [PROTO_MM, PROTO_CC, PROTO_SMS, PROTO_SS, PROTO_RRM];

const MESSAGE: &str = "Message";
const TID: &str = "TID";
const TI_FLAG: &str = "TIFlag";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pdu {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attrs: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Pdu>,
}

impl Pdu {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..Self::default()
        }
    }

    pub fn with_text(tag: &str, text: &str) -> Self {
        Self {
            tag: tag.to_string(),
            text: text.to_string(),
            ..Self::default()
        }
    }

    /// Root element for `proto` holding an empty `Message` of `msg_type`.
    pub fn l3(proto: &str, msg_type: &str) -> Self {
        Self::new(proto).with_child(Self::new(MESSAGE).with_attr("type", msg_type))
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_child(mut self, child: Pdu) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        if let Some(slot) = self.attrs.iter_mut().find(|(k, _)| k == name) {
            slot.1 = value.to_string();
        } else {
            self.attrs.push((name.to_string(), value.to_string()));
        }
    }

    pub fn child(&self, tag: &str) -> Option<&Pdu> {
        self.children.iter().find(|c| c.tag == tag)
    }

    pub fn child_mut(&mut self, tag: &str) -> Option<&mut Pdu> {
        self.children.iter_mut().find(|c| c.tag == tag)
    }

    pub fn child_text(&self, tag: &str) -> Option<&str> {
        self.child(tag).map(|c| c.text.as_str())
    }

    pub fn push(&mut self, child: Pdu) {
        self.children.push(child);
    }

    /// First child element, if any.
    pub fn first_child(&self) -> Option<&Pdu> {
        self.children.first()
    }

    pub fn message(&self) -> Option<&Pdu> {
        self.child(MESSAGE)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.message().and_then(|m| m.attr("type"))
    }

    pub fn ie(&self, name: &str) -> Option<&Pdu> {
        self.message().and_then(|m| m.child(name))
    }

    pub fn ie_text(&self, name: &str) -> Option<&str> {
        self.ie(name).map(|c| c.text.as_str())
    }

    /// Append an IE to the `Message` element, creating it when absent.
    pub fn add_ie(&mut self, ie: Pdu) {
        if self.child(MESSAGE).is_none() {
            self.children.push(Pdu::new(MESSAGE));
        }
        if let Some(msg) = self.child_mut(MESSAGE) {
            msg.push(ie);
        }
    }

    pub fn with_ie(mut self, ie: Pdu) -> Self {
        self.add_ie(ie);
        self
    }

    pub fn with_ie_text(self, name: &str, text: &str) -> Self {
        self.with_ie(Pdu::with_text(name, text))
    }

    /// Transaction identifier: call reference and TI flag.
    pub fn tid(&self) -> Option<(&str, bool)> {
        let tid = self.child(TID)?;
        let flag = tid.attr(TI_FLAG) == Some("true");
        Some((tid.text.as_str(), flag))
    }

    pub fn with_tid(mut self, call_ref: &str, ti_flag: bool) -> Self {
        let tid = Pdu::with_text(TID, call_ref).with_attr(TI_FLAG, bool_str(ti_flag));
        // TID precedes the message element
        self.children.insert(0, tid);
        self
    }
}

pub fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Composite transaction key, `o<ref>` for TI flag set, `i<ref>` otherwise.
pub fn tid_key(call_ref: &str, ti_flag: bool) -> String {
    format!("{}{}", tid_prefix(ti_flag), call_ref)
}

pub fn tid_prefix(ti_flag: bool) -> char {
    if ti_flag {
        'o'
    } else {
        'i'
    }
}

/// `Cause` IE with location and coding attributes.
pub fn cause_ie(reason: &str) -> Pdu {
    let reason = if reason.is_empty() { "normal" } else { reason };
    let location = match reason {
        "busy" | "noresponse" | "noanswer" => "U",
        _ => "LPN",
    };
    Pdu::with_text("Cause", reason)
        .with_attr("location", location)
        .with_attr("coding", "GSM-PLMN")
}

/// Mobile identity IE with a single identity child.
pub fn mobile_identity(kind: &str, value: &str) -> Pdu {
    Pdu::new("MobileIdentity").with_child(Pdu::with_text(kind, value))
}
