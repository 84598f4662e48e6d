//! Call control.
//!
//! A [`Channel`] groups the calls of one subscriber connection, at most
//! [`MAX_CALLS`] of them. Calls leaving a channel wait in the terminated
//! list for the final RELEASE-COMPLETE of the MS, guarded by T305/T308.
//!
//! Lock order: channel list, channel, connection. Outbound messages may be
//! sent with a channel lock held; collaborator events are enqueued after it
//! is released.

use crate::collaborator::Event;
use crate::connection::{ConnHandle, ConnUsage};
use crate::engine::Engine;
use crate::error::BtsError;
use crate::message::{Message, Primitive};
use crate::mm::{start_paging, stop_paging, PagingChannel};
use crate::pdu::{bool_str, cause_ie, tid_key, Pdu, PROTO_CC};
use crate::signalling::Signalling;
use crate::sms::route_and_execute;
use crate::ue::Ue;
use heapless::Vec as CallList;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Call references of a channel: 0..=6.
pub const MAX_CALLS: usize = 7;
const TRAFFIC_SPEECH: u8 = 1;

/// GSM 04.08 call states, valued as in the CallState IE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum CallState {
    Null = 0,
    CallInitiated = 1,
    ConnPending = 2,
    CallProceeding = 3,
    CallDelivered = 4,
    CallPresent = 5,
    CallReceived = 6,
    ConnectReq = 8,
    CallConfirmed = 9,
    Active = 10,
    Disconnect = 12,
    Release = 19,
    Connect = 28,
}

impl CallState {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            CallState::Null => "Null",
            CallState::CallInitiated => "CallInitiated",
            CallState::ConnPending => "ConnPending",
            CallState::CallProceeding => "CallProceeding",
            CallState::CallDelivered => "CallDelivered",
            CallState::CallPresent => "CallPresent",
            CallState::CallReceived => "CallReceived",
            CallState::ConnectReq => "ConnectReq",
            CallState::CallConfirmed => "CallConfirmed",
            CallState::Active => "Active",
            CallState::Disconnect => "Disconnect",
            CallState::Release => "Release",
            CallState::Connect => "Connect",
        }
    }
}

/// One call reference on a connection.
#[derive(Debug)]
pub struct CallDesc {
    pub call_ref: String,
    /// Mobile originated.
    pub incoming: bool,
    /// False for emergency calls.
    pub regular: bool,
    pub state: CallState,
    pub reason: String,
    pub called: String,
    pub conn_id: u16,
    /// Timer deadline in ms, 0 when not armed.
    pub timeout: u64,
    pub rel_sent: u8,
    _usage: ConnUsage,
}

impl CallDesc {
    fn new(conn: &ConnHandle, call_ref: &str, incoming: bool, regular: bool) -> Self {
        Self {
            call_ref: call_ref.to_string(),
            incoming,
            regular,
            state: CallState::Null,
            reason: String::new(),
            called: String::new(),
            conn_id: conn.id(),
            timeout: 0,
            rel_sent: 0,
            _usage: conn.acquire(false),
        }
    }

    /// Lookup key as seen in messages from the MS.
    pub fn key(&self) -> String {
        tid_key(&self.call_ref, !self.incoming)
    }

    fn reason(&self) -> &str {
        if self.reason.is_empty() {
            "normal"
        } else {
            &self.reason
        }
    }

    fn change_state(&mut self, state: CallState) {
        if self.state == state {
            return;
        }
        info!(
            "Call '{}' conn={} changed state {} -> {}",
            self.key(),
            self.conn_id,
            self.state.name(),
            state.name()
        );
        self.state = state;
    }

    fn send_cc<I>(&self, sig: &Signalling, msg_type: &str, ies: I) -> bool
    where
        I: IntoIterator<Item = Pdu>,
    {
        let pdu = ies
            .into_iter()
            .fold(cc_message(msg_type, &self.call_ref, self.incoming), Pdu::with_ie);
        sig.send_l3(self.conn_id, pdu, 0)
    }

    fn set_timeout(&mut self, now: u64, interval_ms: u64) {
        self.timeout = now + interval_ms;
    }

    fn setup(&mut self, sig: &Signalling, ies: Vec<Pdu>) -> bool {
        if !self.send_cc(sig, "Setup", ies) {
            return false;
        }
        self.change_state(CallState::CallPresent);
        true
    }

    fn proceeding(&mut self, sig: &Signalling) {
        self.change_state(CallState::CallProceeding);
        self.send_cc(sig, "CallProceeding", None);
    }

    fn alert(&mut self, sig: &Signalling, indicator: Option<Pdu>) {
        self.change_state(CallState::CallDelivered);
        self.send_cc(sig, "Alerting", indicator);
    }

    fn connect(&mut self, sig: &Signalling, indicator: Option<Pdu>) {
        self.change_state(CallState::ConnectReq);
        self.send_cc(sig, "Connect", indicator);
    }

    fn hangup(&mut self, sig: &Signalling) {
        self.change_state(CallState::Disconnect);
        self.send_cc(sig, "Disconnect", Some(cause_ie(self.reason())));
    }

    fn send_status(&self, sig: &Signalling, cause: &str) {
        self.send_cc(sig, "Status", [cause_ie(cause), call_state_ie(self.state)]);
    }

    fn send_wrong_state(&self, sig: &Signalling) {
        self.send_status(sig, "wrong-state-message");
    }

    fn release(&mut self, sig: &Signalling) {
        self.change_state(CallState::Release);
        self.rel_sent = self.rel_sent.saturating_add(1);
        send_gsm_rel(sig, true, &self.call_ref, self.incoming, self.reason(), self.conn_id);
    }

    fn release_complete(&mut self, sig: &Signalling) {
        self.change_state(CallState::Null);
        send_gsm_rel(sig, false, &self.call_ref, self.incoming, self.reason(), self.conn_id);
    }
}

fn cc_message(msg_type: &str, call_ref: &str, ti_flag: bool) -> Pdu {
    Pdu::l3(PROTO_CC, msg_type).with_tid(call_ref, ti_flag)
}

fn call_state_ie(state: CallState) -> Pdu {
    Pdu::with_text("CallState", &state.code().to_string())
}

/// Send Release or ReleaseComplete for a call reference.
fn send_gsm_rel(sig: &Signalling, rel: bool, call_ref: &str, ti_flag: bool, reason: &str, conn_id: u16) {
    let msg_type = if rel { "Release" } else { "ReleaseComplete" };
    let pdu = cc_message(msg_type, call_ref, ti_flag).with_ie(cause_ie(reason));
    sig.send_l3(conn_id, pdu, 0);
}

fn progress_indicator(params: &Event, early_media: bool) -> Option<Pdu> {
    if let Some(ind) = params.value("progress.indicator") {
        return Some(Pdu::with_text("ProgressIndicator", ind));
    }
    (early_media && params.get_bool("earlymedia", false)).then(|| Pdu::with_text("ProgressIndicator", "inband"))
}

struct ChanInner {
    conn: Option<ConnHandle>,
    usage: Option<ConnUsage>,
    calls: CallList<CallDesc, MAX_CALLS>,
    /// Key of the call collaborator notifications apply to.
    active: Option<String>,
    next_cref: u8,
    wait_for_traffic: bool,
    dtmf: Option<char>,
    hungup: bool,
    paging: bool,
    /// Earliest call timer, 0 when none.
    timeout: u64,
    /// IEs of an MT SETUP not sent yet.
    pending: Option<Vec<Pdu>>,
    /// Routing request held until the traffic channel is up.
    route: Option<Event>,
    reason: String,
    peer_id: String,
}

/// Voice channel of one subscriber.
pub struct Channel {
    id: String,
    ue: Arc<Ue>,
    incoming: bool,
    inner: Mutex<ChanInner>,
}

impl Channel {
    fn new(id: String, ue: Arc<Ue>, incoming: bool) -> Self {
        info!(
            "{} channel {} for IMSI={}",
            if incoming { "Incoming" } else { "Outgoing" },
            id,
            ue.imsi()
        );
        Self {
            id,
            ue,
            incoming,
            inner: Mutex::new(ChanInner {
                conn: None,
                usage: None,
                calls: CallList::new(),
                active: None,
                next_cref: 0,
                wait_for_traffic: false,
                dtmf: None,
                hungup: false,
                paging: false,
                timeout: 0,
                pending: None,
                route: None,
                reason: String::new(),
                peer_id: String::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ue(&self) -> &Arc<Ue> {
        &self.ue
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    fn lock(&self) -> MutexGuard<'_, ChanInner> {
        self.inner.lock()
    }

    pub fn conn_id(&self) -> Option<u16> {
        self.lock().conn.as_ref().map(|c| c.id())
    }

    pub fn peer_id(&self) -> String {
        self.lock().peer_id.clone()
    }

    /// Keys and states of the live calls.
    pub fn calls(&self) -> Vec<(String, CallState)> {
        self.lock().calls.iter().map(|c| (c.key(), c.state)).collect()
    }

    fn bind(inner: &mut ChanInner, conn: &ConnHandle) {
        inner.usage = Some(conn.acquire(false));
        inner.conn = Some(Arc::clone(conn));
    }

    fn event(&self, name: &str) -> Event {
        Event::new(name).with("id", self.id.clone())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CcStats {
    pub incoming: u64,
    pub outgoing: u64,
    pub refused: u64,
    pub hangups: u64,
}

pub struct CallManager {
    channels: Mutex<Vec<Arc<Channel>>>,
    terminated: Mutex<Vec<CallDesc>>,
    next_id: AtomicU64,
    accept_calls: bool,
    t305_ms: u64,
    t308_ms: u64,
    t313_ms: u64,
    stats: Mutex<CcStats>,
}

impl CallManager {
    pub fn new(accept_calls: bool, t305_ms: u64, t308_ms: u64, t313_ms: u64) -> Self {
        Self {
            channels: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            accept_calls,
            t305_ms,
            t308_ms,
            t313_ms,
            stats: Mutex::new(CcStats::default()),
        }
    }

    pub fn stats(&self) -> CcStats {
        self.stats.lock().clone()
    }

    pub fn find(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.lock().iter().find(|c| c.id == id).cloned()
    }

    pub fn find_by_conn(&self, conn_id: u16) -> Option<Arc<Channel>> {
        self.channels
            .lock()
            .iter()
            .find(|c| c.conn_id() == Some(conn_id))
            .cloned()
    }

    pub fn find_by_ue(&self, ue: &Arc<Ue>) -> Option<Arc<Channel>> {
        self.channels
            .lock()
            .iter()
            .find(|c| Arc::ptr_eq(&c.ue, ue))
            .cloned()
    }

    pub fn channel_ids(&self) -> Vec<String> {
        self.channels.lock().iter().map(|c| c.id.clone()).collect()
    }

    pub fn terminated_count(&self) -> usize {
        self.terminated.lock().len()
    }

    /// State of a call waiting in the terminated list.
    pub fn terminated_state(&self, conn_id: u16, key: &str) -> Option<CallState> {
        self.terminated
            .lock()
            .iter()
            .find(|c| c.conn_id == conn_id && c.key() == key)
            .map(|c| c.state)
    }

    fn new_id(&self) -> String {
        format!("bts/{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn can_accept(&self, eng: &Engine) -> bool {
        self.accept_calls && eng.sig().is_running()
    }

    pub fn handle_pdu(&self, eng: &Engine, conn: &ConnHandle, pdu: &Pdu) {
        let Some(msg_type) = pdu.message_type() else {
            warn!("Missing 'type' in CC on connection {}", conn.id());
            return;
        };
        let tid = pdu.tid().filter(|(call_ref, _)| !call_ref.is_empty());
        if let Some(chan) = self.find_by_conn(conn.id()) {
            let Some((call_ref, ti_flag)) = tid else {
                debug!("{} with empty transaction identifier on {}", msg_type, chan.id);
                return;
            };
            if self.channel_cc(eng, &chan, msg_type, pdu, call_ref, ti_flag) {
                return;
            }
        }
        if matches!(msg_type, "Setup" | "EmergencySetup") {
            let refusal = if conn.ue().is_none() {
                Some("no user associated with connection")
            } else if tid.is_some_and(|(_, ti_flag)| ti_flag) {
                Some("invalid direction")
            } else if !self.can_accept(eng) {
                Some("full or exiting")
            } else {
                None
            };
            match (refusal, tid) {
                (None, Some((call_ref, _))) => {
                    self.start_incoming(eng, conn, msg_type == "Setup", call_ref, pdu);
                }
                (None, None) => debug!("{} with empty call ref conn={}", msg_type, conn.id()),
                (Some(why), tid) => {
                    info!("Refusing new GSM call conn={}: {}", conn.id(), why);
                    self.stats.lock().refused += 1;
                    if let Some((call_ref, ti_flag)) = tid {
                        send_gsm_rel(eng.sig(), false, call_ref, !ti_flag, "noconn", conn.id());
                    }
                }
            }
            return;
        }
        let Some((call_ref, ti_flag)) = tid else {
            return;
        };
        if self.terminated_cc(eng, conn.id(), msg_type, call_ref, ti_flag) || msg_type == "ReleaseComplete" {
            return;
        }
        debug!("Unhandled CC {} for callref={} conn={}", msg_type, call_ref, conn.id());
        send_gsm_rel(eng.sig(), false, call_ref, !ti_flag, "invalid-callref", conn.id());
    }

    /// Handle a message for a call that already left its channel.
    fn terminated_cc(&self, eng: &Engine, conn_id: u16, msg_type: &str, call_ref: &str, ti_flag: bool) -> bool {
        let key = tid_key(call_ref, ti_flag);
        let sig = eng.sig();
        let mut list = self.terminated.lock();
        let Some(pos) = list.iter().position(|c| c.conn_id == conn_id && c.key() == key) else {
            return false;
        };
        match msg_type {
            "ReleaseComplete" | "Release" | "Disconnect" => {
                let call = &mut list[pos];
                if msg_type == "Disconnect" && call.state == CallState::Disconnect {
                    call.release(sig);
                    call.set_timeout(eng.clock().now_ms(), self.t308_ms);
                    return true;
                }
                info!("Removing terminated call '{}' conn={}", key, conn_id);
                if msg_type != "ReleaseComplete" {
                    call.release_complete(sig);
                }
                let call = list.remove(pos);
                drop(list);
                drop(call);
            }
            "StatusEnquiry" => list[pos].send_status(sig, "status-enquiry-rsp"),
            "Status" => {}
            _ => list[pos].send_wrong_state(sig),
        }
        true
    }

    /// Dispatch a message to a call of `chan`. Returns false when no call
    /// matches and the message does not start one.
    fn channel_cc(
        &self,
        eng: &Engine,
        chan: &Arc<Channel>,
        msg_type: &str,
        pdu: &Pdu,
        call_ref: &str,
        ti_flag: bool,
    ) -> bool {
        let setup = matches!(msg_type, "Setup" | "EmergencySetup");
        let key = tid_key(call_ref, ti_flag);
        let sig = eng.sig();
        let mut inner = chan.lock();
        let Some(pos) = inner.calls.iter().position(|c| c.key() == key) else {
            drop(inner);
            if setup {
                self.handle_setup(eng, chan, msg_type == "Setup", call_ref, pdu);
                return true;
            }
            return false;
        };
        debug!("Handling '{}' in call {} on {}", msg_type, key, chan.id);
        if matches!(msg_type, "Release" | "ReleaseComplete" | "Disconnect") {
            if inner.active.as_deref() == Some(key.as_str()) {
                inner.active = None;
            }
            let mut call = inner.calls.remove(pos);
            call.reason = pdu.ie_text("Cause").unwrap_or_default().to_string();
            let reason = call.reason.clone();
            let disc = inner.calls.is_empty();
            drop(inner);
            info!("Removing call '{}' on {}", key, chan.id);
            match msg_type {
                "Release" => call.release_complete(sig),
                "ReleaseComplete" => call.change_state(CallState::Null),
                _ => {
                    call.release(sig);
                    call.set_timeout(eng.clock().now_ms(), self.t308_ms);
                    self.add_terminated(eng, call);
                }
            }
            if disc {
                self.hangup(eng, chan, Some(&reason));
            }
            return true;
        }
        let ChanInner { calls, dtmf, .. } = &mut *inner;
        let call = &mut calls[pos];
        let mut notify = None;
        match msg_type {
            "Setup" | "EmergencySetup" | "CallProceeding" | "Progress" => call.send_wrong_state(sig),
            "Connect" => {
                if matches!(call.state, CallState::CallConfirmed | CallState::CallReceived) {
                    call.send_cc(sig, "ConnectAcknowledge", None);
                    call.change_state(CallState::Active);
                    notify = Some(chan.event("call.answered"));
                } else {
                    call.send_wrong_state(sig);
                }
            }
            "Alerting" => {
                if call.state == CallState::CallConfirmed {
                    call.change_state(CallState::CallReceived);
                    notify = Some(chan.event("call.ringing"));
                } else {
                    call.send_wrong_state(sig);
                }
            }
            "CallConfirmed" => {
                if matches!(call.state, CallState::Null | CallState::CallPresent) {
                    call.change_state(CallState::CallConfirmed);
                    notify = Some(chan.event("call.progress"));
                } else {
                    call.send_wrong_state(sig);
                }
            }
            "ConnectAcknowledge" => {
                if call.state == CallState::ConnectReq {
                    call.change_state(CallState::Active);
                    call.timeout = 0;
                } else {
                    call.send_wrong_state(sig);
                }
            }
            "StatusEnquiry" => call.send_status(sig, "status-enquiry-rsp"),
            "Status" => {
                let cause = pdu.ie_text("Cause").unwrap_or_default();
                let state = pdu.ie_text("CallState").unwrap_or_default();
                if cause == "status-enquiry-rsp" {
                    debug!("Received status cause='{}' call_state='{}' on {}", cause, state, chan.id);
                } else {
                    warn!("Received status cause='{}' call_state='{}' on {}", cause, state, chan.id);
                }
            }
            "StartDTMF" => {
                let digit = pdu.ie_text("KeypadFacility").unwrap_or_default();
                if let Some(cur) = *dtmf {
                    info!("Received DTMF '{}' while still in '{}' on {}", digit, cur, chan.id);
                    call.send_cc(sig, "StartDTMFReject", Some(cause_ie("wrong-state-message")));
                } else if let Some(first) = digit.chars().next() {
                    *dtmf = Some(first);
                    call.send_cc(sig, "StartDTMFAck", Some(Pdu::with_text("KeypadFacility", digit)));
                    notify = Some(
                        chan.event("chan.dtmf")
                            .with("text", digit)
                            .with("detected", "gsm"),
                    );
                } else {
                    info!("Received no KeypadFacility in StartDTMF on {}", chan.id);
                    call.send_cc(sig, "StartDTMFReject", Some(cause_ie("missing-mandatory-ie")));
                }
            }
            "StopDTMF" => {
                *dtmf = None;
                call.send_cc(sig, "StopDTMFAck", None);
            }
            // no multiparty support
            "Hold" => {
                call.send_cc(sig, "HoldReject", Some(cause_ie("service-unavailable")));
            }
            "Retrieve" => {
                call.send_cc(sig, "RetrieveReject", Some(cause_ie("service-unavailable")));
            }
            _ => call.send_status(sig, "unknown-message"),
        }
        drop(inner);
        if let Some(ev) = notify {
            eng.collaborator().enqueue(ev);
        }
        true
    }

    /// Add an MO call to `chan`. Returns the called number when the call
    /// was accepted.
    fn handle_setup(
        &self,
        eng: &Engine,
        chan: &Arc<Channel>,
        regular: bool,
        call_ref: &str,
        pdu: &Pdu,
    ) -> Option<String> {
        let sig = eng.sig();
        let conn = chan.lock().conn.clone()?;
        sig.send(&Message::new(Primitive::AllocMedia, 0, Some(conn.id())));
        let mut call = CallDesc::new(&conn, call_ref, true, regular);
        call.called = pdu.ie_text("CalledPartyBCDNumber").unwrap_or_default().to_string();
        let mut inner = chan.lock();
        if inner.calls.is_empty() {
            call.proceeding(sig);
            let key = call.key();
            let called = call.called.clone();
            if inner.calls.push(call).is_err() {
                return None;
            }
            inner.active.get_or_insert_with(|| key.clone());
            info!("Added call '{}' on {}", key, chan.id);
            inner.wait_for_traffic = !conn.start_traffic(TRAFFIC_SPEECH, sig);
            return Some(called);
        }
        drop(inner);
        info!("Refusing subsequent call '{}' on {}", call.key(), chan.id);
        self.stats.lock().refused += 1;
        call.release_complete(sig);
        None
    }

    fn start_incoming(&self, eng: &Engine, conn: &ConnHandle, regular: bool, call_ref: &str, pdu: &Pdu) {
        let Some(ue) = conn.ue() else {
            return;
        };
        let chan = Arc::new(Channel::new(self.new_id(), Arc::clone(&ue), true));
        Channel::bind(&mut chan.lock(), conn);
        let Some(called) = self.handle_setup(eng, &chan, regular, call_ref, pdu) else {
            return;
        };
        self.channels.lock().push(Arc::clone(&chan));
        self.stats.lock().incoming += 1;
        let mut route = chan.event("call.route");
        if let Some(caller) = ue.caller() {
            route.set("caller", caller);
        }
        if !called.is_empty() {
            route.set("called", called.clone());
        }
        route.set("username", ue.imsi());
        let imei = ue.imei();
        if !imei.is_empty() {
            route.set("imei", imei);
        }
        route.set("emergency", bool_str(!regular));
        if pdu.ie("CLIRInvocation").is_some() {
            route.set("privacy", "true");
        } else if pdu.ie("CLIRSuppresion").is_some() {
            route.set("privacy", "false");
        }
        let mut startup = chan.event("chan.startup");
        if let Some(caller) = route.value("caller") {
            startup.set("caller", caller);
        }
        if !called.is_empty() {
            startup.set("called", called);
        }
        eng.collaborator().enqueue(startup);
        let route = {
            let mut inner = chan.lock();
            if inner.wait_for_traffic {
                inner.route = Some(route);
                None
            } else {
                Some(route)
            }
        };
        if let Some(route) = route {
            self.start_route(eng, &chan, route);
        }
    }

    fn start_route(&self, eng: &Engine, chan: &Arc<Channel>, route: Event) {
        let chan_id = chan.id.clone();
        let started = eng.spawn_worker("call-route", move |eng| {
            debug!("Routing {}", chan_id);
            let (ok, ev) = route_and_execute(eng, route, "call.execute");
            move |eng: &Engine, current: bool| {
                if current {
                    eng.cc().route_done(eng, &chan_id, ok, &ev);
                }
            }
        });
        if !started {
            self.hangup(eng, chan, Some("failure"));
        }
    }

    fn route_done(&self, eng: &Engine, chan_id: &str, ok: bool, ev: &Event) {
        let Some(chan) = self.find(chan_id) else {
            debug!("Routed channel {} is gone", chan_id);
            return;
        };
        if ok {
            let peer = ev.get_or("peerid", "").to_string();
            debug!("Channel {} routed peer='{}'", chan_id, peer);
            chan.lock().peer_id = peer;
            return;
        }
        let reason = ev.get_or("error", "noroute").to_string();
        info!("Routing {} failed: {}", chan_id, reason);
        self.hangup(eng, &chan, Some(&reason));
    }

    /// Start an MT call towards `dest`. Returns the channel id.
    pub fn place_call(&self, eng: &Engine, dest: &str, params: &Event) -> Result<String, BtsError> {
        if !eng.supervisor().is_radio_up() {
            warn!("GSM call: Radio is not up!");
            return Err(BtsError::RadioNotReady);
        }
        let ue = eng
            .mm()
            .directory()
            .find(dest)
            .ok_or_else(|| BtsError::Offline(dest.to_string()))?;
        info!("MT call to IMSI={} TMSI={}", ue.imsi(), ue.tmsi());
        if self.find_by_ue(&ue).is_some() {
            // no call waiting
            return Err(BtsError::Busy);
        }
        let mut ies = Vec::new();
        if !params.get_bool("privacy", false) {
            if let Some(caller) = params.value("caller") {
                ies.push(Pdu::with_text("CallingPartyBCDNumber", caller));
            }
        }
        let chan = Arc::new(Channel::new(self.new_id(), Arc::clone(&ue), false));
        let conn = eng.sig().registry().find_by_ue(&ue);
        {
            let mut inner = chan.lock();
            inner.pending = Some(ies);
            if let Some(c) = &conn {
                Channel::bind(&mut inner, c);
            }
        }
        self.channels.lock().push(Arc::clone(&chan));
        self.stats.lock().outgoing += 1;
        if conn.is_none() {
            let paging = start_paging(&ue, PagingChannel::Voice, eng.sig());
            chan.lock().paging = paging;
        }
        self.start_mt(eng, &chan, None, false);
        if chan.lock().hungup {
            return Err(BtsError::Failure("failure".to_string()));
        }
        Ok(chan.id.clone())
    }

    /// Send the pending MT SETUP once a connection and traffic channel are
    /// available.
    fn start_mt(&self, eng: &Engine, chan: &Arc<Channel>, conn: Option<&ConnHandle>, paging_rsp: bool) {
        let sig = eng.sig();
        let mut inner = chan.lock();
        let was_paging = paging_rsp && std::mem::take(&mut inner.paging);
        if let (Some(c), None) = (conn, inner.conn.as_ref()) {
            Channel::bind(&mut inner, c);
        }
        let fail = match inner.conn.clone() {
            None => paging_rsp || !inner.paging,
            Some(conn) => {
                let no_ref = usize::from(inner.next_cref) >= MAX_CALLS;
                if no_ref || inner.pending.is_none() {
                    if no_ref {
                        warn!("Could not allocate new call ref on {}", chan.id);
                    }
                    (paging_rsp || !inner.paging) && inner.calls.is_empty()
                } else {
                    inner.wait_for_traffic = !conn.start_traffic(TRAFFIC_SPEECH, sig);
                    if !inner.wait_for_traffic {
                        let call_ref = inner.next_cref.to_string();
                        inner.next_cref += 1;
                        let ies = inner.pending.take().unwrap_or_default();
                        let mut call = CallDesc::new(&conn, &call_ref, false, true);
                        call.setup(sig, ies);
                        let _ = inner.calls.push(call);
                    }
                    false
                }
            }
        };
        drop(inner);
        if was_paging {
            stop_paging(&chan.ue, sig);
        }
        if fail {
            self.hangup(eng, chan, Some("failure"));
        }
    }

    /// MT services check after a connection to `ue` appeared.
    pub fn check_mt(&self, eng: &Engine, ue: &Arc<Ue>, conn: &ConnHandle, paging_rsp: bool) {
        if let Some(chan) = self.find_by_ue(ue) {
            self.start_mt(eng, &chan, Some(conn), paging_rsp);
        }
    }

    /// Traffic channel answer for `conn_id`.
    pub fn media_rsp(&self, eng: &Engine, conn_id: u16, ok: bool) {
        let Some(chan) = self.find_by_conn(conn_id) else {
            return;
        };
        if !ok {
            info!("Got media error notification on {}", chan.id);
            chan.lock().wait_for_traffic = false;
            self.hangup(eng, &chan, Some("nomedia"));
            return;
        }
        debug!("Got media started notification on {}", chan.id);
        if chan.incoming {
            let route = {
                let mut inner = chan.lock();
                inner.wait_for_traffic = false;
                inner.route.take()
            };
            if let Some(route) = route {
                self.start_route(eng, &chan, route);
            }
            return;
        }
        let start = {
            let mut inner = chan.lock();
            std::mem::take(&mut inner.wait_for_traffic) && inner.pending.is_some()
        };
        if start {
            self.start_mt(eng, &chan, None, false);
        }
    }

    fn active_call(inner: &mut ChanInner) -> Option<&mut CallDesc> {
        let key = inner.active.clone()?;
        inner.calls.iter_mut().find(|c| c.key() == key)
    }

    fn with_active<F>(&self, chan_id: &str, f: F) -> Result<(), BtsError>
    where
        F: FnOnce(&mut CallDesc, &mut u64),
    {
        let chan = self
            .find(chan_id)
            .ok_or_else(|| BtsError::NoChannel(chan_id.to_string()))?;
        let mut inner = chan.lock();
        if inner.hungup {
            return Err(BtsError::Failure("hungup".to_string()));
        }
        let mut timeout = inner.timeout;
        let call = Self::active_call(&mut inner).ok_or_else(|| BtsError::Failure("no active call".to_string()))?;
        f(call, &mut timeout);
        inner.timeout = timeout;
        Ok(())
    }

    /// Call progress reported by the routing engine.
    pub fn call_progress(&self, eng: &Engine, chan_id: &str, params: &Event) -> Result<(), BtsError> {
        self.with_active(chan_id, |call, _| {
            if call.incoming {
                call.send_cc(eng.sig(), "Progress", progress_indicator(params, true));
            }
        })
    }

    pub fn call_ringing(&self, eng: &Engine, chan_id: &str, params: &Event) -> Result<(), BtsError> {
        self.with_active(chan_id, |call, _| {
            if call.incoming && call.state == CallState::CallProceeding {
                call.alert(eng.sig(), progress_indicator(params, true));
            }
        })
    }

    pub fn call_answered(&self, eng: &Engine, chan_id: &str, params: &Event) -> Result<(), BtsError> {
        let now = eng.clock().now_ms();
        let t313 = self.t313_ms;
        self.with_active(chan_id, |call, timeout| {
            call.connect(eng.sig(), progress_indicator(params, false));
            call.set_timeout(now, t313);
            *timeout = call.timeout;
        })
    }

    /// Hang up a channel on request of the routing engine.
    pub fn hangup_call(&self, eng: &Engine, chan_id: &str, reason: &str) -> Result<(), BtsError> {
        let chan = self
            .find(chan_id)
            .ok_or_else(|| BtsError::NoChannel(chan_id.to_string()))?;
        self.hangup(eng, &chan, Some(reason));
        Ok(())
    }

    /// Release every call of `chan` and remove it.
    pub(crate) fn hangup(&self, eng: &Engine, chan: &Arc<Channel>, reason: Option<&str>) {
        let sig = eng.sig();
        let now = eng.clock().now_ms();
        let (calls, done, reason, paging, usage) = {
            let mut inner = chan.lock();
            if let Some(r) = reason.filter(|r| !r.is_empty()) {
                inner.reason = r.to_string();
            }
            inner.active = None;
            inner.pending = None;
            inner.route = None;
            let calls = std::mem::take(&mut inner.calls);
            let done = std::mem::replace(&mut inner.hungup, true);
            let paging = std::mem::take(&mut inner.paging);
            (calls, done, inner.reason.clone(), paging, inner.usage.take())
        };
        for mut call in calls {
            call.reason = reason.clone();
            if call.state == CallState::Active {
                call.hangup(sig);
                call.set_timeout(now, self.t305_ms);
            } else {
                call.release(sig);
                call.set_timeout(now, self.t308_ms);
            }
            self.add_terminated(eng, call);
        }
        if paging {
            stop_paging(&chan.ue, sig);
        }
        drop(usage);
        if done {
            return;
        }
        info!("Channel {} hangup reason='{}'", chan.id, reason);
        self.stats.lock().hangups += 1;
        self.channels.lock().retain(|c| !Arc::ptr_eq(c, chan));
        let mut ev = chan.event("chan.hangup");
        if !reason.is_empty() {
            ev.set("reason", reason);
        }
        eng.collaborator().enqueue(ev);
    }

    pub fn hangup_all(&self, eng: &Engine, reason: &str) {
        let channels = self.channels.lock().clone();
        for chan in channels {
            self.hangup(eng, &chan, Some(reason));
        }
    }

    fn add_terminated(&self, eng: &Engine, mut call: CallDesc) {
        if call.timeout == 0 {
            debug!(
                "Setting terminated call '{}' conn={} timeout to {}ms",
                call.key(),
                call.conn_id,
                self.t305_ms
            );
            call.set_timeout(eng.clock().now_ms(), self.t305_ms);
        }
        self.terminated.lock().push(call);
    }

    pub fn clear_terminated(&self) {
        let calls = std::mem::take(&mut *self.terminated.lock());
        drop(calls);
    }

    /// Forget the terminated calls of a released connection.
    pub fn remove_terminated(&self, conn_id: u16) {
        let removed: Vec<CallDesc> = {
            let mut list = self.terminated.lock();
            let (gone, keep) = std::mem::take(&mut *list)
                .into_iter()
                .partition(|c| c.conn_id == conn_id);
            *list = keep;
            gone
        };
        for call in &removed {
            debug!("Removing terminated call '{}' conn={}: connection released", call.key(), conn_id);
        }
    }

    /// Connection `conn_id` is gone: its channel loses every call.
    pub fn conn_released(&self, eng: &Engine, conn_id: u16) {
        if let Some(chan) = self.find_by_conn(conn_id) {
            info!("Connection {} released under {}", conn_id, chan.id);
            let (calls, usage) = {
                let mut inner = chan.lock();
                inner.active = None;
                inner.reason = "net-out-of-order".to_string();
                inner.conn = None;
                (std::mem::take(&mut inner.calls), inner.usage.take())
            };
            drop(calls);
            drop(usage);
            self.hangup(eng, &chan, None);
        }
        self.remove_terminated(conn_id);
    }

    /// Drive T305/T308 on terminated calls and T313 on channels.
    pub fn check_timers(&self, eng: &Engine, now: u64) {
        let sig = eng.sig();
        let mut expired = Vec::new();
        {
            let mut list = self.terminated.lock();
            let mut i = 0;
            while i < list.len() {
                let call = &mut list[i];
                if call.timeout > now {
                    i += 1;
                    continue;
                }
                if call.state == CallState::Disconnect || (call.state == CallState::Release && call.rel_sent == 1) {
                    call.release(sig);
                    call.set_timeout(now, self.t308_ms);
                    i += 1;
                    continue;
                }
                warn!("Terminated call '{}' conn={} timed out", call.key(), call.conn_id);
                expired.push(list.remove(i));
            }
        }
        drop(expired);
        let channels = self.channels.lock().clone();
        for chan in channels {
            let mut inner = chan.lock();
            if inner.timeout == 0 || inner.timeout > now {
                continue;
            }
            inner.timeout = 0;
            let expired = inner
                .calls
                .first()
                .is_some_and(|c| c.state == CallState::ConnectReq && c.timeout != 0 && c.timeout <= now);
            if expired {
                let mut call = inner.calls.remove(0);
                info!("Call '{}' expired in state {} on {}", call.key(), call.state.name(), chan.id);
                call.reason = "timeout".to_string();
                call.release_complete(sig);
                if inner.active.as_deref() == Some(call.key().as_str()) {
                    inner.active = None;
                }
                if inner.calls.is_empty() {
                    drop(inner);
                    drop(call);
                    self.hangup(eng, &chan, Some("timeout"));
                    continue;
                }
            }
            if let Some(first) = inner.calls.first() {
                inner.timeout = first.timeout;
            }
        }
    }
}
