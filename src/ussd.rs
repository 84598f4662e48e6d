//! USSD sessions carried by the SS protocol.
//!
//! A session lives in the SS slot of its connection. MT sessions for a
//! subscriber without a usable connection are parked here while paging runs
//! and move to the connection once it shows up.

use crate::collaborator::Event;
use crate::config::USSD_TIMEOUT_MIN_MS;
use crate::connection::ConnHandle;
use crate::engine::Engine;
use crate::error::BtsError;
use crate::mm::{start_paging, stop_paging, PagingChannel};
use crate::pdu::{cause_ie, tid_key, Pdu, PROTO_SS};
use crate::sms::route_and_execute;
use crate::tid::Tid;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Prefix of every session id.
pub const SS_PREFIX: &str = "btsss/";

// MAP component tree produced by the Facility codec
pub const COMPONENT: &str = "component";
pub const LOCAL_CID: &str = "localCID";
pub const REMOTE_CID: &str = "remoteCID";
pub const COMPONENT_TYPE: &str = "type";
pub const OPERATION_CODE: &str = "operationCode";
pub const USSD_TEXT: &str = "ussd-Text";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UssdOperation {
    Pssr,
    Ussr,
    Ussn,
    Pssd,
}

impl UssdOperation {
    const ALL: [UssdOperation; 4] = [
        UssdOperation::Pssr,
        UssdOperation::Ussr,
        UssdOperation::Ussn,
        UssdOperation::Pssd,
    ];

    pub fn name(self) -> &'static str {
        match self {
            UssdOperation::Pssr => "pssr",
            UssdOperation::Ussr => "ussr",
            UssdOperation::Ussn => "ussn",
            UssdOperation::Pssd => "pssd",
        }
    }

    /// MAP operation code name.
    pub fn map_name(self) -> &'static str {
        match self {
            UssdOperation::Pssr => "processUnstructuredSS-Request",
            UssdOperation::Ussr => "unstructuredSS-Request",
            UssdOperation::Ussn => "unstructuredSS-Notify",
            UssdOperation::Pssd => "processUnstructuredSS-Data",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    pub fn from_map_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.map_name() == name)
    }
}

/// SS message with optional cause and Facility IE.
pub fn ss_message(msg_type: &str, call_ref: &str, ti_flag: bool, cause: Option<&str>, facility: Option<&str>) -> Pdu {
    let mut pdu = Pdu::l3(PROTO_SS, msg_type).with_tid(call_ref, ti_flag);
    if let Some(f) = facility.filter(|f| !f.is_empty()) {
        pdu.add_ie(Pdu::with_text("Facility", f));
    }
    if let Some(c) = cause {
        pdu.add_ie(cause_ie(c));
    }
    pdu
}

/// The component of a decoded Facility: the root itself or its first
/// `component` child.
fn component(tree: &Pdu) -> Option<&Pdu> {
    if tree.tag == COMPONENT {
        Some(tree)
    } else {
        tree.child(COMPONENT)
    }
}

/// Copy operation and text of a decoded Facility into `ev`.
fn export_component(ev: &mut Event, tree: &Pdu) {
    let Some(comp) = component(tree) else {
        return;
    };
    if let Some(op) = comp.attr(OPERATION_CODE).and_then(UssdOperation::from_map_name) {
        if ev.get("operation_type").is_none() {
            ev.set("operation_type", op.name());
        }
    }
    if let Some(text) = comp.child(USSD_TEXT).filter(|t| !t.text.is_empty()) {
        ev.set("text", text.text.clone());
        for (name, value) in &text.attrs {
            ev.set(&format!("text.{name}"), value.clone());
        }
    }
}

/// Facility content ready to encode.
enum Facility {
    Encoded(String),
    Component(Pdu),
}

/// Build the Facility component for an outgoing message. `ss` is `None` for
/// a new MT session.
fn facility_component(params: &Event, ss: Option<&mut Tid>, update: bool) -> Result<Facility, String> {
    if let Some(raw) = params.value("component") {
        return Ok(Facility::Encoded(raw.to_string()));
    }
    let Some(text) = params.value("text") else {
        return Err(String::new());
    };
    let oper = params.get_or("operation_type", "");
    let op = UssdOperation::from_name(oper);
    let allowed = match (&ss, op) {
        (Some(_), Some(UssdOperation::Ussr | UssdOperation::Ussn)) => update,
        (Some(ss), Some(UssdOperation::Pssr)) => ss.incoming,
        (None, Some(UssdOperation::Ussr | UssdOperation::Ussn)) => true,
        _ => false,
    };
    let Some(op) = op.filter(|_| allowed) else {
        return Err(format!("unknown operation '{oper}'"));
    };
    let invoke = op != UssdOperation::Pssr;
    let mut comp = Pdu::new(COMPONENT);
    match ss {
        Some(ss) if invoke => comp.set_attr(LOCAL_CID, &ss.next_cid().to_string()),
        Some(ss) => {
            if ss.start_cid >= 0 {
                comp.set_attr(REMOTE_CID, &ss.start_cid.to_string());
            }
        }
        None => comp.set_attr(LOCAL_CID, "0"),
    }
    comp.set_attr(COMPONENT_TYPE, if invoke { "Invoke" } else { "ResultLast" });
    comp.set_attr(OPERATION_CODE, op.map_name());
    let mut txt = Pdu::with_text(USSD_TEXT, text);
    for (key, value) in &params.params {
        if let Some(attr) = key.strip_prefix("text.").filter(|a| !a.is_empty()) {
            txt.set_attr(attr, value);
        }
    }
    comp.push(txt);
    Ok(Facility::Component(comp))
}

fn encode_facility(eng: &Engine, facility: Facility) -> Result<String, String> {
    match facility {
        Facility::Encoded(raw) => Ok(raw),
        Facility::Component(comp) => eng
            .collaborator()
            .map_encode(&comp)
            .ok()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| "encode failed".to_string()),
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UssdStats {
    pub mo_sessions: u64,
    pub mt_sessions: u64,
    pub rejected: u64,
    pub updates: u64,
    pub finalized: u64,
    pub timeouts: u64,
}

pub struct UssdManager {
    parked: Mutex<Vec<Tid>>,
    next_id: AtomicU64,
    timeout_ms: u64,
    stats: Mutex<UssdStats>,
}

impl UssdManager {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            parked: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            timeout_ms: timeout_ms.max(USSD_TIMEOUT_MIN_MS),
            stats: Mutex::new(UssdStats::default()),
        }
    }

    pub fn stats(&self) -> UssdStats {
        self.stats.lock().clone()
    }

    pub fn parked_ids(&self) -> Vec<String> {
        self.parked.lock().iter().map(|t| t.id.clone()).collect()
    }

    fn new_id(&self) -> String {
        format!("{SS_PREFIX}{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn handle_pdu(&self, eng: &Engine, conn: &ConnHandle, info: u8, pdu: &Pdu) {
        let Some(msg_type) = pdu.message_type() else {
            warn!("Missing 'type' in SS on connection {}", conn.id());
            return;
        };
        let Some((call_ref, ti_flag)) = pdu.tid() else {
            info!("SS {} conn={} with missing transaction identifier", msg_type, conn.id());
            return;
        };
        match msg_type {
            "Facility" => self.handle_ss(eng, conn, info, call_ref, ti_flag, pdu, true),
            "ReleaseComplete" => self.handle_ss(eng, conn, info, call_ref, ti_flag, pdu, false),
            "Register" => {
                let _usage = conn.acquire(false);
                if let Err((cause, reason)) = self.register(eng, conn, info, call_ref, ti_flag, pdu) {
                    info!("Rejecting SS Register on conn={}: {}", conn.id(), reason);
                    self.stats.lock().rejected += 1;
                    let rsp = ss_message("ReleaseComplete", call_ref, !ti_flag, Some(cause), None);
                    eng.sig().send_l3(conn.id(), rsp, info);
                }
            }
            _ => info!("Unhandled SS {} conn={}", msg_type, conn.id()),
        }
    }

    /// Facility or ReleaseComplete from the MS on an existing session.
    #[allow(clippy::too_many_arguments)]
    fn handle_ss(
        &self,
        eng: &Engine,
        conn: &ConnHandle,
        info: u8,
        call_ref: &str,
        ti_flag: bool,
        pdu: &Pdu,
        facility: bool,
    ) {
        let key = tid_key(call_ref, ti_flag);
        let (ev, ended) = {
            let mut inner = conn.lock();
            if !inner.ss.as_ref().is_some_and(|t| t.key() == key) {
                drop(inner);
                info!("SS {} on conn={}: unknown session", pdu.message_type().unwrap_or_default(), conn.id());
                if facility {
                    let rsp = ss_message("ReleaseComplete", call_ref, !ti_flag, Some("invalid-callref"), None);
                    eng.sig().send_l3(conn.id(), rsp, info);
                }
                return;
            }
            if facility {
                (inner.ss.as_ref().map(|t| t.ss_event(true)), None)
            } else {
                let ss = inner.ss.take();
                (ss.as_ref().map(|t| t.ss_event(false)), ss)
            }
        };
        drop(ended);
        if let Some(ev) = ev {
            self.enqueue_ss(eng, ev, pdu.ie_text("Facility"), facility, None);
        }
    }

    /// Validate an MO Register and start routing it. Errors carry the cause
    /// sent back to the MS.
    fn register(
        &self,
        eng: &Engine,
        conn: &ConnHandle,
        sapi: u8,
        call_ref: &str,
        ti_flag: bool,
        pdu: &Pdu,
    ) -> Result<(), (&'static str, String)> {
        let protocol = |reason: &str| ("protocol-error", reason.to_string());
        if ti_flag {
            return Err(("invalid-callref", "wrong TI flag 'true'".to_string()));
        }
        let ue = conn.ue().ok_or_else(|| protocol("missing UE"))?;
        if !ue.is_registered() {
            return Err(protocol("UE not registered"));
        }
        let facility = pdu
            .ie_text("Facility")
            .filter(|f| !f.is_empty())
            .ok_or_else(|| ("missing-mandatory-ie", "empty Facility IE".to_string()))?;
        let tree = eng
            .collaborator()
            .map_decode(facility)
            .map_err(|e| protocol(&format!("failed to decode Facility IE error={e}")))?;
        let comp = component(&tree).ok_or_else(|| protocol("failed to retrieve Facility IE component"))?;
        let cid = comp
            .attr(REMOTE_CID)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| protocol("missing remote CID"))?;
        let start_cid = cid
            .parse::<i32>()
            .map_err(|_| protocol(&format!("invalid remote CID '{cid}'")))?;
        let comp_type = comp.attr(COMPONENT_TYPE).unwrap_or_default();
        if comp_type != "Invoke" {
            return Err(protocol(&format!("unexpected Facility IE component type '{comp_type}'")));
        }
        let oper = comp.attr(OPERATION_CODE).unwrap_or_default();
        if UssdOperation::from_map_name(oper) != Some(UssdOperation::Pssr) {
            return Err(protocol(&format!("unknown Facility operation code '{oper}'")));
        }
        let text = comp
            .child(USSD_TEXT)
            .filter(|t| !t.text.is_empty())
            .ok_or_else(|| ("facility-rejected", "empty USSD string".to_string()))?;

        let id = format!("{}/{}", self.new_id(), conn.id());
        let mut ss = Tid::new(id.clone(), call_ref, true, sapi);
        ss.start_cid = start_cid;
        ss.timeout = eng.clock().now_ms() + self.timeout_ms;
        let timeout = ss.timeout;
        ss.bind(Some(conn));
        {
            let mut inner = conn.lock();
            if inner.ss.as_ref().is_some_and(|t| t.key() == ss.key()) {
                drop(inner);
                debug!("Ignoring SS Register on conn={} TID={}: already exists", conn.id(), call_ref);
                return Ok(());
            }
            if inner.ss.is_some() {
                drop(inner);
                return Err(protocol("SS busy"));
            }
            inner.ss = Some(ss);
        }
        eng.sig().registry().schedule_check(timeout);
        info!("MO USSD '{}' IMSI={} started", id, ue.imsi());
        self.stats.lock().mo_sessions += 1;

        let mut ev = Event::new("call.route")
            .with("route_type", "ussd")
            .with("called", text.text.clone())
            .with("id", id)
            .with("operation_type", UssdOperation::Pssr.name())
            .with("text", text.text.clone());
        for (name, value) in &text.attrs {
            ev.set(&format!("text.{name}"), value.clone());
        }
        if let Some(caller) = ue.caller() {
            ev.set("caller", caller);
        }
        ev.set("username", ue.imsi());
        ev.payload = Some(tree.clone());
        let conn_id = conn.id();
        let imsi = ue.imsi().to_string();
        let submit_ref = call_ref.to_string();
        let started = eng.spawn_worker("ussd-submit", move |eng| {
            debug!("Started MO USSD submit IMSI={} callRef={}", imsi, submit_ref);
            let (ok, ev) = route_and_execute(eng, ev, "ussd.execute");
            move |eng: &Engine, current: bool| {
                if current {
                    eng.ussd().mo_executed(eng, conn_id, &submit_ref, ok, &ev);
                }
            }
        });
        if !started {
            let p = Event::new("ussd.execute").with("error", "facility-rejected");
            self.mo_executed(eng, conn.id(), call_ref, false, &p);
        }
        Ok(())
    }

    /// Result of routing an MO session.
    pub fn mo_executed(&self, eng: &Engine, conn_id: u16, call_ref: &str, ok: bool, result: &Event) {
        let key = tid_key(call_ref, false);
        let dropped = eng.sig().registry().find(conn_id).and_then(|conn| {
            let mut inner = conn.lock();
            let ss = inner.ss.as_mut().filter(|t| t.key() == key)?;
            if ok {
                ss.peer_id = result.get_or("peerid", "").to_string();
                debug!("MO USSD '{}' routed peer='{}'", ss.id, ss.peer_id);
                Some(None)
            } else {
                Some(inner.ss.take())
            }
        });
        match dropped {
            Some(Some(ss)) => {
                let reason = result.get_or("error", "failure").to_string();
                self.drop_session(eng, conn_id, ss, true, false, &reason);
            }
            Some(None) => {}
            None if ok => {
                // session gone meanwhile: close it on the network side
                let mut ev = Event::new("ussd.finalize");
                for key in ["id", "peerid"] {
                    if let Some(v) = result.value(key) {
                        ev.set(key, v);
                    }
                }
                eng.collaborator().enqueue(ev);
            }
            None => debug!("MO USSD conn={} callRef={} is gone", conn_id, call_ref),
        }
    }

    /// Enqueue `ussd.update`/`ussd.finalize` with the decoded Facility.
    /// Returns false when a Facility could not be decoded and nothing was
    /// sent.
    fn enqueue_ss(&self, eng: &Engine, mut ev: Event, facility_ie: Option<&str>, facility: bool, error: Option<&str>) -> bool {
        if !facility {
            if let Some(e) = error.filter(|e| !e.is_empty()) {
                ev.set("error", e);
            }
        }
        match facility_ie.filter(|f| !f.is_empty()).map(|f| (f, eng.collaborator().map_decode(f))) {
            Some((_, Ok(tree))) => {
                export_component(&mut ev, &tree);
                ev.payload = Some(tree);
            }
            Some((raw, Err(e))) if facility => {
                info!("Can't enqueue '{}': failed to decode facility '{}' error='{}'", ev.name, raw, e);
                return false;
            }
            None if facility => {
                info!("Can't enqueue '{}': no facility", ev.name);
                return false;
            }
            Some((raw, Err(e))) => {
                info!("Enqueueing '{}', failed to decode facility '{}' error='{}'", ev.name, raw, e);
            }
            None => {}
        }
        let mut stats = self.stats.lock();
        if facility {
            stats.updates += 1;
        } else {
            stats.finalized += 1;
        }
        drop(stats);
        eng.collaborator().enqueue(ev);
        true
    }

    /// Release a session towards the MS and/or the network.
    pub fn drop_session(&self, eng: &Engine, conn_id: u16, mut ss: Tid, to_ms: bool, to_net: bool, reason: &str) {
        if ss.paging {
            if let Some(ue) = ss.ue.as_ref() {
                stop_paging(ue, eng.sig());
            }
            ss.paging = false;
        }
        if !(to_ms || to_net) {
            return;
        }
        info!(
            "Dropping SS session '{}' conn={} reason={}",
            ss.id,
            conn_id,
            reason
        );
        if to_ms {
            let rsp = ss_message("ReleaseComplete", &ss.call_ref, ss.incoming, Some(reason), None);
            eng.sig().send_l3(conn_id, rsp, ss.sapi);
        }
        if to_net {
            self.enqueue_ss(eng, ss.ss_event(false), None, false, Some(reason));
        }
    }

    /// `ussd.update` from the network.
    pub fn update(&self, eng: &Engine, params: &Event) -> Result<(), BtsError> {
        self.handle_network(eng, params, true)
    }

    /// `ussd.finalize` from the network.
    pub fn finalize(&self, eng: &Engine, params: &Event) -> Result<(), BtsError> {
        self.handle_network(eng, params, false)
    }

    fn handle_network(&self, eng: &Engine, params: &Event, update: bool) -> Result<(), BtsError> {
        let what = if update { "update" } else { "finalize" };
        let ss_id = params.get_or("peerid", "");
        let Some(rest) = ss_id.strip_prefix(SS_PREFIX) else {
            return Err(BtsError::NoChannel(ss_id.to_string()));
        };
        let registry = eng.sig().registry();
        let conn = match rest.split_once('/') {
            Some((_, conn_id)) => conn_id.parse::<u16>().ok().and_then(|id| registry.find(id)),
            None => {
                let mut parked = self.parked.lock();
                if let Some(pos) = parked.iter().position(|t| t.id == ss_id) {
                    if update {
                        info!("USSD update for idle session '{}'", ss_id);
                        return Err(BtsError::Failure("failure".to_string()));
                    }
                    let ss = parked.remove(pos);
                    drop(parked);
                    info!("MT USSD '{}' cancelled", ss.id);
                    self.drop_session(eng, 0, ss, false, false, "cancelled");
                    return Ok(());
                }
                drop(parked);
                registry.find_by_ss(ss_id)
            }
        };
        let Some(conn) = conn else {
            info!("USSD {}: no session with id '{}'", what, ss_id);
            return Err(BtsError::NoChannel(ss_id.to_string()));
        };
        let mut ended = None;
        let (call_ref, incoming, sapi, facility) = {
            let mut inner = conn.lock();
            if !inner.ss.as_ref().is_some_and(|t| t.id == ss_id) {
                drop(inner);
                info!("USSD {}: no session with id '{}'", what, ss_id);
                return Err(BtsError::NoChannel(ss_id.to_string()));
            }
            if !update {
                ended = inner.ss.take();
            }
            let Some(ss) = ended.as_mut().or(inner.ss.as_mut()) else {
                return Err(BtsError::NoChannel(ss_id.to_string()));
            };
            let facility = facility_component(params, Some(&mut *ss), update);
            (ss.call_ref.clone(), ss.incoming, ss.sapi, facility)
        };
        let facility = facility.and_then(|f| encode_facility(eng, f));
        let sent = if update {
            match facility {
                Ok(f) => eng.sig().send_l3(
                    conn.id(),
                    ss_message("Facility", &call_ref, incoming, None, Some(&f)),
                    sapi,
                ),
                Err(reason) => {
                    let reason = if reason.is_empty() { "no facility to send on session" } else { &reason };
                    info!("USSD update session '{}': {}", ss_id, reason);
                    return Err(BtsError::Failure("failure".to_string()));
                }
            }
        } else {
            let facility = match facility {
                Ok(f) => Some(f),
                Err(reason) => {
                    if !reason.is_empty() {
                        info!("USSD finalize session '{}' not sending facility: {}", ss_id, reason);
                    }
                    None
                }
            };
            let cause = params.value("error");
            eng.sig().send_l3(
                conn.id(),
                ss_message("ReleaseComplete", &call_ref, incoming, cause, facility.as_deref()),
                sapi,
            )
        };
        drop(ended);
        if sent {
            Ok(())
        } else {
            Err(BtsError::Failure("interworking".to_string()))
        }
    }

    /// Start an MT session towards `dest`. Returns the session id.
    pub fn execute(&self, eng: &Engine, dest: &str, params: &Event) -> Result<String, BtsError> {
        if !eng.supervisor().is_radio_up() {
            warn!("MT USSD to '{}': Radio is not up!", dest);
            return Err(BtsError::RadioNotReady);
        }
        let Some(ue) = eng.mm().directory().find(dest) else {
            info!("MT USSD to '{}': offline", dest);
            return Err(BtsError::Offline(dest.to_string()));
        };
        let facility = facility_component(params, None, false)
            .and_then(|f| encode_facility(eng, f))
            .map_err(|reason| {
                let reason = if reason.is_empty() { "empty text" } else { &reason };
                info!("MT USSD to '{}' failed: {}", dest, reason);
                BtsError::Failure("failure".to_string())
            })?;
        let id = self.new_id();
        let timeout = params.get_int(
            "timeout",
            self.timeout_ms as i64,
            USSD_TIMEOUT_MIN_MS as i64,
            i64::MAX,
        ) as u64;
        let mut ss = Tid::new(id.clone(), "0", false, 0);
        ss.timeout = eng.clock().now_ms() + timeout;
        ss.data = facility;
        ss.peer_id = params.get_or("id", "").to_string();
        ss.start_cid = 0;
        ss.cid = 0;
        ss.ue = Some(Arc::clone(&ue));
        self.stats.lock().mt_sessions += 1;
        match eng.sig().registry().find_by_ue(&ue) {
            Some(conn) if !conn.waiting_for_traffic() => {
                self.start_mt(eng, &conn, ss).map_err(|why| match why {
                    "busy" => BtsError::Busy,
                    other => BtsError::Failure(other.to_string()),
                })?;
            }
            conn => {
                if conn.is_none() {
                    ss.paging = start_paging(&ue, PagingChannel::Ss, eng.sig());
                    if !ss.paging {
                        info!("MT USSD to '{}' failed to start paging", dest);
                        return Err(BtsError::Failure("failure".to_string()));
                    }
                }
                info!("Enqueued MT USSD session '{}' to IMSI={}", id, ue.imsi());
                self.parked.lock().push(ss);
            }
        }
        Ok(id)
    }

    /// Put an MT session in the SS slot of `conn` and send Register.
    fn start_mt(&self, eng: &Engine, conn: &ConnHandle, mut ss: Tid) -> Result<(), &'static str> {
        let imsi = conn.ue().map(|u| u.imsi().to_string()).unwrap_or_default();
        let id = ss.id.clone();
        let call_ref = ss.call_ref.clone();
        let sapi = ss.sapi;
        let timeout = ss.timeout;
        let register = ss_message("Register", &call_ref, false, None, Some(&ss.data));
        ss.bind(Some(conn));
        {
            let mut inner = conn.lock();
            if inner.ss.is_some() {
                drop(inner);
                info!("MT USSD '{}' IMSI={} failed: SS busy", id, imsi);
                return Err("busy");
            }
            inner.ss = Some(ss);
        }
        eng.sig().registry().schedule_check(timeout);
        if eng.sig().send_l3(conn.id(), register, sapi) {
            info!("MT USSD '{}' IMSI={} started", id, imsi);
            return Ok(());
        }
        let taken = {
            let mut inner = conn.lock();
            if inner.ss.as_ref().is_some_and(|t| t.id == id) {
                inner.ss.take()
            } else {
                None
            }
        };
        drop(taken);
        info!("MT USSD '{}' IMSI={} failed to start", id, imsi);
        Err("failure")
    }

    /// Move parked sessions of the subscriber on `conn` to it.
    pub fn check_conn(&self, eng: &Engine, conn: &ConnHandle) {
        let Some(ue) = conn.ue() else {
            return;
        };
        if conn.waiting_for_traffic() {
            return;
        }
        let mine: Vec<Tid> = {
            let mut parked = self.parked.lock();
            let (mine, rest) = std::mem::take(&mut *parked)
                .into_iter()
                .partition(|t| t.ue.as_ref().is_some_and(|u| Arc::ptr_eq(u, &ue)));
            *parked = rest;
            mine
        };
        for mut ss in mine {
            if std::mem::take(&mut ss.paging) {
                stop_paging(&ue, eng.sig());
            }
            let mut ev = ss.ss_event(false);
            if self.start_mt(eng, conn, ss).is_err() {
                ev.set("error", "busy");
                self.stats.lock().finalized += 1;
                eng.collaborator().enqueue(ev);
            }
        }
    }

    /// Expire parked sessions.
    pub fn check_timeouts(&self, eng: &Engine, now: u64) {
        let expired: Vec<Tid> = {
            let mut parked = self.parked.lock();
            let (expired, rest) = std::mem::take(&mut *parked)
                .into_iter()
                .partition(|t| t.timeout <= now);
            *parked = rest;
            expired
        };
        for ss in expired {
            info!("Idle MT USSD '{}' timed out", ss.id);
            self.stats.lock().timeouts += 1;
            self.drop_session(eng, 0, ss, false, true, "timeout");
        }
    }

    /// Finalize every parked session.
    pub fn drop_parked(&self, eng: &Engine, reason: &str) {
        let all = std::mem::take(&mut *self.parked.lock());
        for ss in all {
            info!("Dropping idle MT USSD '{}' reason={}", ss.id, reason);
            self.drop_session(eng, 0, ss, false, true, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names() {
        assert_eq!(UssdOperation::from_name("ussn"), Some(UssdOperation::Ussn));
        assert_eq!(
            UssdOperation::from_map_name("processUnstructuredSS-Request"),
            Some(UssdOperation::Pssr)
        );
        assert_eq!(UssdOperation::from_name("bogus"), None);
    }

    #[test]
    fn test_mt_component() {
        let params = Event::new("ussd.execute")
            .with("text", "Balance: 5")
            .with("operation_type", "ussn")
            .with("text.dcs", "15");
        let Ok(Facility::Component(comp)) = facility_component(&params, None, false) else {
            panic!("component expected");
        };
        assert_eq!(comp.attr(COMPONENT_TYPE), Some("Invoke"));
        assert_eq!(comp.attr(LOCAL_CID), Some("0"));
        assert_eq!(comp.attr(OPERATION_CODE), Some("unstructuredSS-Notify"));
        let txt = comp.child(USSD_TEXT).expect("text");
        assert_eq!(txt.text, "Balance: 5");
        assert_eq!(txt.attr("dcs"), Some("15"));

        let pssr = Event::new("ussd.execute").with("text", "x").with("operation_type", "pssr");
        assert!(facility_component(&pssr, None, false).is_err());
    }

    #[test]
    fn test_session_component_rules() {
        let mut mo = Tid::new("btsss/1/3".into(), "0", true, 0);
        mo.start_cid = 4;
        let finalize = Event::new("ussd.finalize").with("text", "bye").with("operation_type", "pssr");
        let Ok(Facility::Component(comp)) = facility_component(&finalize, Some(&mut mo), false) else {
            panic!("component expected");
        };
        assert_eq!(comp.attr(COMPONENT_TYPE), Some("ResultLast"));
        assert_eq!(comp.attr(REMOTE_CID), Some("4"));

        // ussr only on update
        let ussr = Event::new("ussd.finalize").with("text", "menu").with("operation_type", "ussr");
        assert!(facility_component(&ussr, Some(&mut mo), false).is_err());
        let Ok(Facility::Component(comp)) = facility_component(&ussr, Some(&mut mo), true) else {
            panic!("component expected");
        };
        assert_eq!(comp.attr(LOCAL_CID), Some("0"));
    }

    #[test]
    fn test_export_component() {
        let tree = Pdu::new("facility").with_child(
            Pdu::new(COMPONENT)
                .with_attr(OPERATION_CODE, "unstructuredSS-Request")
                .with_child(Pdu::with_text(USSD_TEXT, "1. Balance").with_attr("dcs", "15")),
        );
        let mut ev = Event::new("ussd.update");
        export_component(&mut ev, &tree);
        assert_eq!(ev.get("operation_type"), Some("ussr"));
        assert_eq!(ev.get("text"), Some("1. Balance"));
        assert_eq!(ev.get("text.dcs"), Some("15"));
    }

    #[test]
    fn test_release_complete_message() {
        let pdu = ss_message("ReleaseComplete", "2", true, Some("busy"), None);
        assert_eq!(pdu.tag, PROTO_SS);
        assert_eq!(pdu.message_type(), Some("ReleaseComplete"));
        assert_eq!(pdu.tid(), Some(("2", true)));
        assert_eq!(pdu.ie_text("Cause"), Some("busy"));
        assert!(pdu.ie("Facility").is_none());
    }
}
