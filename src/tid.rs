//! USSD transaction state tracked outside call control.

use crate::collaborator::Event;
use crate::connection::{ConnHandle, ConnUsage};
use crate::pdu::tid_prefix;
use crate::ue::Ue;
use std::sync::Arc;
use tracing::trace;

/// Non-call transaction (USSD session) bound to at most one connection.
#[derive(Debug)]
pub struct Tid {
    pub id: String,
    pub call_ref: String,
    /// Mobile originated.
    pub incoming: bool,
    pub sapi: u8,
    /// Expiry in ms, 0 when not armed.
    pub timeout: u64,
    _usage: Option<ConnUsage>,
    pub conn_id: Option<u16>,
    pub ue: Option<Arc<Ue>>,
    /// Holds a paging reference on `ue`.
    pub paging: bool,
    /// Facility IE waiting to be sent.
    pub data: String,
    pub peer_id: String,
    pub start_cid: i32,
    pub cid: i32,
}

impl Tid {
    pub fn new(id: String, call_ref: &str, incoming: bool, sapi: u8) -> Self {
        Self {
            id,
            call_ref: call_ref.to_string(),
            incoming,
            sapi,
            timeout: 0,
            _usage: None,
            conn_id: None,
            ue: None,
            paging: false,
            data: String::new(),
            peer_id: String::new(),
            start_cid: -1,
            cid: -1,
        }
    }

    /// Key of this transaction in L3 messages: `o`/`i` prefix and reference.
    pub fn key(&self) -> String {
        format!("{}{}", tid_prefix(!self.incoming), self.call_ref)
    }

    /// Move the transaction to `conn`, releasing usage of the previous one
    /// first.
    pub fn bind(&mut self, conn: Option<&ConnHandle>) {
        // old usage goes before new usage is taken
        self._usage = None;
        self.conn_id = conn.map(|c| c.id());
        if let Some(c) = conn {
            self._usage = Some(c.acquire(false));
        }
        trace!("USSD {} bound to connection {:?}", self.id, self.conn_id);
    }

    /// Next component id, wrapping inside 0..=127.
    pub fn next_cid(&mut self) -> i32 {
        self.cid = if self.cid >= 127 { 0 } else { self.cid + 1 };
        self.cid
    }

    /// `ussd.update` or `ussd.finalize` notification for this session.
    pub fn ss_event(&self, update: bool) -> Event {
        let mut ev = Event::new(if update { "ussd.update" } else { "ussd.finalize" }).with("id", self.id.clone());
        if !self.peer_id.is_empty() {
            ev.set("peerid", self.peer_id.clone());
        }
        ev
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_wraps() {
        let mut t = Tid::new("btsss/1".into(), "0", false, 0);
        assert_eq!(t.next_cid(), 0);
        t.cid = 126;
        assert_eq!(t.next_cid(), 127);
        assert_eq!(t.next_cid(), 0);
    }

    #[test]
    fn test_key_and_event() {
        let mut t = Tid::new("btsss/2/9".into(), "3", true, 0);
        assert_eq!(t.key(), "i3");
        t.peer_id = "peer-1".into();
        let ev = t.ss_event(false);
        assert_eq!(ev.name, "ussd.finalize");
        assert_eq!(ev.get("id"), Some("btsss/2/9"));
        assert_eq!(ev.get("peerid"), Some("peer-1"));
    }
}
