//! Short message transfer over the CP/RP layers.
//!
//! MO messages are acknowledged at CP level at once, parked on their
//! connection and routed by a worker. MT messages wait in one FIFO queue per
//! subscriber; only the head is ever on the air.

use crate::collaborator::Event;
use crate::config::{MT_SMS_TIMEOUT_MAX_MS, MT_SMS_TIMEOUT_MIN_MS};
use crate::connection::{ConnHandle, ConnUsage};
use crate::engine::Engine;
use crate::error::BtsError;
use crate::mm::{start_paging, stop_paging, PagingChannel};
use crate::pdu::{Pdu, PROTO_SMS};
use crate::rp::{self, MtDeliver, RpError, RpMessageType};
use crate::ue::Ue;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Call references of MT transactions cycle through 0..=6.
const MAX_MT_TID: u8 = 7;
const SMS_SAPI: u8 = 3;
const RP_CAUSE_DEFAULT: i64 = 111;
const RP_CAUSE_UNEXPECTED: u8 = 98;
const RP_CAUSE_UNKNOWN: u8 = 97;
const RP_CAUSE_TEMP_FAILURE: u8 = 41;

/// Pending MO message parked on its connection until the MS acknowledges
/// our final RP response.
#[derive(Debug)]
pub struct SmsInfo {
    pub call_ref: String,
    pub sapi: u8,
    pub rp_msg_ref: u8,
    pub incoming: bool,
    _usage: ConnUsage,
}

pub fn cp_data(call_ref: &str, ti_flag: bool, rpdu: &str) -> Pdu {
    Pdu::l3(PROTO_SMS, "CP-Data")
        .with_tid(call_ref, ti_flag)
        .with_ie_text("RPDU", rpdu)
}

/// CP-Ack, or CP-Error carrying `cause`.
pub fn cp_response(call_ref: &str, ti_flag: bool, cause: Option<&str>) -> Pdu {
    match cause {
        None => Pdu::l3(PROTO_SMS, "CP-Ack").with_tid(call_ref, ti_flag),
        Some(c) => Pdu::l3(PROTO_SMS, "CP-Error")
            .with_tid(call_ref, ti_flag)
            .with_ie_text("CP-Cause", c),
    }
}

/// Final state of an MT message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtSmsOutcome {
    pub ok: bool,
    pub reason: Option<String>,
    /// RPDU answered by the MS, if any.
    pub rpdu: Option<String>,
}

impl MtSmsOutcome {
    fn failed(reason: &str) -> Self {
        Self {
            ok: false,
            reason: Some(reason.to_string()),
            rpdu: None,
        }
    }

    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or("failure")
    }
}

/// Handle returned to the submitter of an MT message.
#[derive(Debug)]
pub struct MtSmsTicket {
    id: String,
    rx: oneshot::Receiver<MtSmsOutcome>,
}

impl MtSmsTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn outcome(self) -> MtSmsOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| MtSmsOutcome::failed("failure"))
    }

    /// Block the current thread. Must not be called from async code.
    pub fn wait(self) -> MtSmsOutcome {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| MtSmsOutcome::failed("failure"))
    }

    pub fn try_outcome(&mut self) -> Option<MtSmsOutcome> {
        self.rx.try_recv().ok()
    }
}

struct MtSms {
    id: String,
    rpdu: String,
    call_ref: String,
    sent: bool,
    deadline: u64,
    reply: Option<oneshot::Sender<MtSmsOutcome>>,
}

impl MtSms {
    fn finish(mut self, outcome: MtSmsOutcome) {
        if outcome.ok {
            info!("MT SMS '{}' finished", self.id);
        } else {
            info!("MT SMS '{}' failed reason='{}'", self.id, outcome.reason());
        }
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(outcome);
        }
    }
}

struct MtSmsQueue {
    ue: Arc<Ue>,
    items: VecDeque<MtSms>,
    conn: Option<ConnHandle>,
    usage: Option<ConnUsage>,
    next_tid: u8,
    paging: bool,
    /// Re-run the queue on the next tick.
    check: bool,
}

impl MtSmsQueue {
    fn new(ue: Arc<Ue>) -> Self {
        Self {
            ue,
            items: VecDeque::new(),
            conn: None,
            usage: None,
            next_tid: 0,
            paging: false,
            check: false,
        }
    }

    fn start_paging(&mut self, eng: &Engine) -> bool {
        if !self.paging {
            self.paging = start_paging(&self.ue, PagingChannel::Sms, eng.sig());
        }
        self.paging
    }

    fn stop_paging(&mut self, eng: &Engine) {
        if self.paging {
            stop_paging(&self.ue, eng.sig());
        }
        self.paging = false;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SmsStats {
    pub mo_received: u64,
    pub mo_rejected: u64,
    pub mt_submitted: u64,
    pub mt_delivered: u64,
    pub mt_failed: u64,
}

enum CpDataError {
    /// Rejected at CP level.
    Cp(&'static str, String),
    /// CP-Data accepted, rejected at RP level.
    Rp(u8, String),
    /// Handled without an error response.
    Done,
}

pub struct SmsManager {
    queues: Mutex<Vec<MtSmsQueue>>,
    next_id: AtomicU64,
    stats: Mutex<SmsStats>,
}

impl Default for SmsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SmsManager {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            stats: Mutex::new(SmsStats::default()),
        }
    }

    pub fn stats(&self) -> SmsStats {
        self.stats.lock().clone()
    }

    /// Number of MT messages waiting for `ue`.
    pub fn pending_for(&self, ue: &Arc<Ue>) -> usize {
        self.queues
            .lock()
            .iter()
            .find(|q| Arc::ptr_eq(&q.ue, ue))
            .map_or(0, |q| q.items.len())
    }

    pub fn handle_pdu(&self, eng: &Engine, conn: &ConnHandle, info: u8, pdu: &Pdu) {
        let Some(msg_type) = pdu.message_type() else {
            warn!("Missing message type in SMS on connection {}", conn.id());
            return;
        };
        let Some((call_ref, ti_flag)) = pdu.tid() else {
            debug!("SMS {} conn={} with missing transaction identifier", msg_type, conn.id());
            return;
        };
        match msg_type {
            "CP-Data" => self.handle_cp_data(eng, conn, info, call_ref, ti_flag, pdu.ie_text("RPDU")),
            "CP-Ack" => self.handle_cp_rsp(eng, conn, call_ref, ti_flag, true),
            "CP-Error" => self.handle_cp_rsp(eng, conn, call_ref, ti_flag, false),
            other => debug!("Unhandled SMS {} conn={}", other, conn.id()),
        }
    }

    fn handle_cp_data(
        &self,
        eng: &Engine,
        conn: &ConnHandle,
        sapi: u8,
        call_ref: &str,
        ti_flag: bool,
        rpdu: Option<&str>,
    ) {
        self.stats.lock().mo_received += 1;
        match self.accept_cp_data(eng, conn, sapi, call_ref, ti_flag, rpdu) {
            Ok(()) | Err(CpDataError::Done) => {}
            Err(CpDataError::Cp(cause, reason)) => {
                info!("Rejecting SMS CP-DATA conn={}: {}", conn.id(), reason);
                self.stats.lock().mo_rejected += 1;
                eng.sig()
                    .send_l3(conn.id(), cp_response(call_ref, !ti_flag, Some(cause)), sapi);
            }
            Err(CpDataError::Rp(cause, reason)) => {
                if ti_flag {
                    return;
                }
                info!("Rejecting SMS CP-DATA conn={} RP-Cause={}: {}", conn.id(), cause, reason);
                self.stats.lock().mo_rejected += 1;
                self.mo_sms_respond(eng, conn.id(), call_ref, cause, None);
            }
        }
    }

    fn accept_cp_data(
        &self,
        eng: &Engine,
        conn: &ConnHandle,
        sapi: u8,
        call_ref: &str,
        ti_flag: bool,
        rpdu: Option<&str>,
    ) -> Result<(), CpDataError> {
        // TI flag set: answer to a transaction we started
        let ue = conn.ue();
        let abort = |cause: &'static str, reason: &str| {
            if ti_flag {
                self.handle_mt_rsp(eng, ue.as_ref(), false, call_ref, None, None);
            }
            CpDataError::Cp(cause, reason.to_string())
        };
        let Some(ue) = ue.clone() else {
            return Err(abort("protocol-error", "missing UE"));
        };
        if !ue.is_registered() {
            return Err(abort("protocol-error", "UE not registered"));
        }
        let rpdu = match rpdu {
            Some(r) if !r.is_empty() => r,
            _ => return Err(abort("invalid-mandatory-info", "empty RPDU")),
        };
        let decoded = match rp::decode_rp(rpdu) {
            Ok(d) => d,
            Err(RpError::InvalidHex) => return Err(abort("invalid-mandatory-info", "invalid RPDU string")),
            Err(_) => return Err(abort("invalid-mandatory-info", "invalid RPDU length")),
        };
        if ti_flag {
            let ok = decoded.rp_type() == RpMessageType::AckFromMs;
            let cause = decoded.cause.map(|c| c.to_string());
            let reply = MtReply {
                rpdu: Some(rpdu),
                respond_sapi: Some(sapi),
            };
            if self.handle_mt_rsp(eng, Some(&ue), ok, call_ref, cause.as_deref(), Some(reply)) {
                return Err(CpDataError::Done);
            }
            return Err(CpDataError::Cp(
                "message-not-compatible-with-SM-protocol-state",
                "unexpected RP-DATA".to_string(),
            ));
        }
        eng.sig().send_l3(conn.id(), cp_response(call_ref, true, None), sapi);
        self.add_mo_sms(conn, call_ref, sapi, decoded.msg_ref);
        match decoded.rp_type() {
            RpMessageType::DataFromMs => {}
            RpMessageType::AckFromMs | RpMessageType::ErrorFromMs => {
                return Err(CpDataError::Rp(RP_CAUSE_UNEXPECTED, "unhandled RP-ACK or RP-ERROR".into()));
            }
            RpMessageType::SmmaFromMs => {
                return Err(CpDataError::Rp(RP_CAUSE_UNEXPECTED, "unhandled RP-SMMA".into()));
            }
            other => {
                return Err(CpDataError::Rp(
                    RP_CAUSE_UNKNOWN,
                    format!("unknown RP message {}", other.code()),
                ));
            }
        }
        let mut ev = Event::new("call.route").with("route_type", "msg");
        if let Some(called) = decoded.party.as_ref().filter(|p| !p.digits.is_empty()) {
            ev.set("called", called.digits.clone());
            set_non_empty(&mut ev, "callednumplan", &called.plan);
            set_non_empty(&mut ev, "callednumtype", &called.nature);
        } else {
            debug!("SMS CP-DATA conn={}: unable to retrieve SMSC number", conn.id());
        }
        if let Some(sms_called) = decoded.sms_party.as_ref().filter(|p| !p.digits.is_empty()) {
            ev.set("sms.called", sms_called.digits.clone());
            set_non_empty(&mut ev, "sms.called.plan", &sms_called.plan);
            set_non_empty(&mut ev, "sms.called.nature", &sms_called.nature);
        }
        if let Some(text) = &decoded.text {
            ev.set("text", text.clone());
            ev.set("text.encoding", decoded.text_encoding.unwrap_or("gsm7bit"));
        }
        ev.set("rpdu", rpdu);
        if self.start_submit(eng, conn.id(), &ue, call_ref, ev) {
            Ok(())
        } else {
            Err(CpDataError::Rp(RP_CAUSE_TEMP_FAILURE, "failed to start worker".into()))
        }
    }

    fn start_submit(&self, eng: &Engine, conn_id: u16, ue: &Ue, call_ref: &str, mut ev: Event) -> bool {
        if let Some(caller) = ue.caller() {
            ev.set("caller", caller);
        }
        let imsi = ue.imsi().to_string();
        let call_ref = call_ref.to_string();
        eng.spawn_worker("sms-submit", move |eng| {
            debug!("Started MO SMS submit IMSI={} callRef={}", imsi, call_ref);
            let (ok, ev) = route_and_execute(eng, ev, "msg.execute");
            let cause = if ok {
                0
            } else {
                ev.get_int("error", RP_CAUSE_DEFAULT, 1, 127) as u8
            };
            let irpdu = ev.value("irpdu").map(str::to_string);
            debug!(
                "MO SMS submit IMSI={} callRef={} terminated cause={}",
                imsi, call_ref, cause
            );
            move |eng: &Engine, current: bool| {
                if current {
                    eng.sms().mo_sms_respond(eng, conn_id, &call_ref, cause, irpdu.as_deref());
                }
            }
        })
    }

    fn handle_cp_rsp(&self, eng: &Engine, conn: &ConnHandle, call_ref: &str, ti_flag: bool, ok: bool) {
        debug!(
            "SMS {} conn={} callRef={} tiFlag={}",
            if ok { "CP-ACK" } else { "CP-ERROR" },
            conn.id(),
            call_ref,
            ti_flag
        );
        if !ti_flag {
            drop(self.remove_sms(conn, call_ref, true));
            return;
        }
        // CP-Ack alone does not complete an MT message, wait for RP-ACK
        if !ok {
            self.handle_mt_rsp(eng, conn.ue().as_ref(), false, call_ref, None, None);
        }
    }

    /// Park an MO message on `conn`, taking a usage reference.
    pub fn add_mo_sms(&self, conn: &ConnHandle, call_ref: &str, sapi: u8, rp_msg_ref: u8) -> bool {
        if conn
            .lock()
            .sms
            .iter()
            .any(|i| i.incoming && i.call_ref == call_ref)
        {
            return true;
        }
        let usage = conn.acquire(false);
        conn.lock().sms.push(SmsInfo {
            call_ref: call_ref.to_string(),
            sapi,
            rp_msg_ref,
            incoming: true,
            _usage: usage,
        });
        debug!("Added MO SMS tid={} to conn {}", call_ref, conn.id());
        true
    }

    /// Take a parked message off `conn`. Drop the result without holding the
    /// connection lock.
    pub fn remove_sms(&self, conn: &ConnHandle, call_ref: &str, incoming: bool) -> Option<SmsInfo> {
        let mut inner = conn.lock();
        let pos = inner
            .sms
            .iter()
            .position(|i| i.incoming == incoming && i.call_ref == call_ref)?;
        let info = inner.sms.remove(pos);
        drop(inner);
        debug!("Removed SMS tid={} from conn {}", call_ref, conn.id());
        Some(info)
    }

    /// Send the final RP answer of an MO message: `rpdu` verbatim when
    /// given, RP-ACK/RP-ERROR built from `cause` otherwise.
    pub fn mo_sms_respond(&self, eng: &Engine, conn_id: u16, call_ref: &str, cause: u8, rpdu: Option<&str>) -> bool {
        let Some(conn) = eng.sig().registry().find(conn_id) else {
            debug!("No connection {} to respond to MO SMS tid={}", conn_id, call_ref);
            return false;
        };
        let found = conn
            .lock()
            .sms
            .iter()
            .find(|i| i.incoming && i.call_ref == call_ref)
            .map(|i| (i.sapi, i.rp_msg_ref));
        let Some((sapi, rp_ref)) = found else {
            debug!("No MO SMS to respond tid={} conn={}", call_ref, conn_id);
            return false;
        };
        let rpdu = match rpdu.filter(|r| !r.is_empty()) {
            Some(r) => r.to_string(),
            None => rp::rp_response(rp_ref, cause),
        };
        eng.sig().send_l3(conn_id, cp_data(call_ref, true, &rpdu), sapi)
    }

    /// Queue an MT message for the subscriber at `dest`.
    pub fn submit(&self, eng: &Engine, dest: &str, params: &Event) -> Result<MtSmsTicket, BtsError> {
        if !eng.supervisor().is_radio_up() {
            warn!("MT SMS: Radio is not up!");
            return Err(BtsError::RadioNotReady);
        }
        let Some(ue) = eng.mm().directory().find(dest) else {
            return Err(BtsError::Offline(dest.to_string()));
        };
        let rpdu = match params.value("rpdu") {
            Some(r) => r.to_string(),
            None => build_deliver(params, eng.clock().now_secs()).ok_or_else(|| {
                info!("MT SMS to IMSI={} TMSI={}: no RPDU", ue.imsi(), ue.tmsi());
                BtsError::Failure("no RPDU".to_string())
            })?,
        };
        let timeout = params.get_int(
            "timeout",
            eng.config().mt_sms_timeout_ms as i64,
            MT_SMS_TIMEOUT_MIN_MS as i64,
            MT_SMS_TIMEOUT_MAX_MS as i64,
        ) as u64;
        let id = params
            .value("id")
            .map_or_else(|| format!("btssms/{}", self.next_id.fetch_add(1, Ordering::Relaxed)), str::to_string);
        let (tx, rx) = oneshot::channel();
        let sms = MtSms {
            id: id.clone(),
            rpdu,
            call_ref: String::new(),
            sent: false,
            deadline: eng.clock().now_ms() + timeout,
            reply: Some(tx),
        };
        info!("MT SMS '{}' to IMSI={}", id, ue.imsi());
        self.stats.lock().mt_submitted += 1;
        let mut queues = self.queues.lock();
        let idx = match queues.iter().position(|q| Arc::ptr_eq(&q.ue, &ue)) {
            Some(i) => i,
            None => {
                queues.push(MtSmsQueue::new(Arc::clone(&ue)));
                queues.len() - 1
            }
        };
        queues[idx].items.push_back(sms);
        if !self.check_queue(eng, &mut queues[idx]) {
            let q = queues.remove(idx);
            self.retire(eng, q);
        }
        Ok(MtSmsTicket { id, rx })
    }

    /// Try to put the head of `q` on the air. Returns false when the queue
    /// is empty.
    fn check_queue(&self, eng: &Engine, q: &mut MtSmsQueue) -> bool {
        loop {
            let Some(head) = q.items.front() else {
                return false;
            };
            if !eng.supervisor().is_radio_up() || head.sent {
                return true;
            }
            if q.paging {
                if q.ue.is_paging() {
                    return true;
                }
                q.stop_paging(eng);
            }
            let conn = match &q.conn {
                Some(c) => Arc::clone(c),
                None => match eng.sig().registry().find_by_ue(&q.ue) {
                    Some(c) => {
                        q.stop_paging(eng);
                        q.usage = Some(c.acquire(true));
                        q.conn = Some(Arc::clone(&c));
                        c
                    }
                    None => {
                        q.start_paging(eng);
                        return true;
                    }
                },
            };
            if conn.waiting_for_traffic() {
                return true;
            }
            let Some(sapi) = conn.start_sapi(SMS_SAPI, eng.sig()) else {
                return true;
            };
            let call_ref = q.next_tid.to_string();
            q.next_tid = (q.next_tid + 1) % MAX_MT_TID;
            let Some(head) = q.items.front_mut() else {
                return false;
            };
            head.call_ref = call_ref;
            if eng
                .sig()
                .send_l3(conn.id(), cp_data(&head.call_ref, false, &head.rpdu), sapi)
            {
                debug!(
                    "MT SMS '{}' to IMSI={} sent on conn {}",
                    head.id,
                    q.ue.imsi(),
                    conn.id()
                );
                head.sent = true;
                return true;
            }
            if let Some(sms) = q.items.pop_front() {
                self.stats.lock().mt_failed += 1;
                sms.finish(MtSmsOutcome::failed("failure"));
            }
        }
    }

    fn retire(&self, eng: &Engine, mut q: MtSmsQueue) {
        q.stop_paging(eng);
        for sms in q.items.drain(..) {
            sms.finish(MtSmsOutcome::failed("failure"));
        }
    }

    /// Final answer to the head MT message of `ue`. Returns false when it
    /// does not match the sent transaction.
    fn handle_mt_rsp(
        &self,
        eng: &Engine,
        ue: Option<&Arc<Ue>>,
        ok: bool,
        call_ref: &str,
        reason: Option<&str>,
        reply: Option<MtReply<'_>>,
    ) -> bool {
        let Some(ue) = ue else {
            return false;
        };
        let mut queues = self.queues.lock();
        let Some(idx) = queues.iter().position(|q| Arc::ptr_eq(&q.ue, ue)) else {
            return false;
        };
        let matched = queues[idx]
            .items
            .front()
            .map(|head| head.sent && head.call_ref == call_ref);
        match matched {
            None => {
                let q = queues.remove(idx);
                self.retire(eng, q);
                return false;
            }
            Some(false) => return false,
            Some(true) => {}
        }
        let q = &mut queues[idx];
        let Some(sms) = q.items.pop_front() else {
            return false;
        };
        debug!("MT SMS '{}' to IMSI={} responded", sms.id, ue.imsi());
        {
            let mut stats = self.stats.lock();
            if ok {
                stats.mt_delivered += 1;
            } else {
                stats.mt_failed += 1;
            }
        }
        sms.finish(MtSmsOutcome {
            ok,
            reason: if ok { None } else { reason.map(str::to_string) },
            rpdu: reply.as_ref().and_then(|r| r.rpdu).map(str::to_string),
        });
        if let (Some(sapi), Some(conn)) = (reply.and_then(|r| r.respond_sapi), q.conn.as_ref()) {
            eng.sig()
                .send_l3(conn.id(), cp_response(call_ref, false, None), sapi);
        }
        if !self.check_queue(eng, q) {
            let q = queues.remove(idx);
            self.retire(eng, q);
        }
        true
    }

    /// Run the queue of `ue`, typically once a connection shows up.
    pub fn check_ue(&self, eng: &Engine, ue: Option<&Arc<Ue>>) {
        let Some(ue) = ue else {
            return;
        };
        let mut queues = self.queues.lock();
        let Some(idx) = queues.iter().position(|q| Arc::ptr_eq(&q.ue, ue)) else {
            return;
        };
        if !self.check_queue(eng, &mut queues[idx]) {
            let q = queues.remove(idx);
            self.retire(eng, q);
        }
    }

    /// Expire messages and re-run queues flagged by a connection release.
    pub fn check_timeouts(&self, eng: &Engine, now: u64) {
        let mut queues = self.queues.lock();
        let mut i = 0;
        while i < queues.len() {
            let q = &mut queues[i];
            let offline = q.ue.is_removed() || q.ue.is_detached();
            let mut head_gone = false;
            let mut idx = 0;
            while idx < q.items.len() {
                let reason = if offline {
                    "offline"
                } else if q.items[idx].deadline <= now {
                    "timeout"
                } else {
                    idx += 1;
                    continue;
                };
                head_gone |= idx == 0;
                if let Some(sms) = q.items.remove(idx) {
                    self.stats.lock().mt_failed += 1;
                    sms.finish(MtSmsOutcome::failed(reason));
                }
            }
            let recheck = std::mem::take(&mut q.check) || head_gone;
            let keep = if recheck {
                self.check_queue(eng, q)
            } else {
                !q.items.is_empty()
            };
            if keep {
                i += 1;
            } else {
                let q = queues.remove(i);
                self.retire(eng, q);
            }
        }
    }

    /// Detach queues from a released connection. Unsent state is restored
    /// so the head goes out again on a new connection.
    pub fn conn_released(&self, eng: &Engine, conn_id: u16) {
        let mut queues = self.queues.lock();
        let Some(q) = queues
            .iter_mut()
            .find(|q| q.conn.as_ref().is_some_and(|c| c.id() == conn_id))
        else {
            return;
        };
        q.conn = None;
        q.usage = None;
        for sms in &mut q.items {
            sms.sent = false;
        }
        q.stop_paging(eng);
        q.check = true;
    }

    /// Fail every queued MT message.
    pub fn terminate_all(&self, eng: &Engine, reason: &str) {
        let queues = std::mem::take(&mut *self.queues.lock());
        for mut q in queues {
            q.stop_paging(eng);
            for sms in q.items.drain(..) {
                sms.finish(MtSmsOutcome::failed(reason));
            }
        }
    }
}

#[derive(Clone, Copy)]
struct MtReply<'a> {
    rpdu: Option<&'a str>,
    /// Acknowledge at CP level on this SAPI.
    respond_sapi: Option<u8>,
}

fn set_non_empty(ev: &mut Event, key: &str, value: &str) {
    if !value.is_empty() {
        ev.set(key, value);
    }
}

/// Two step routing shared by MO SMS and USSD: `call.route`, then
/// `execute` towards the returned target. Returns whether the execute
/// request was handled, and the event holding its results.
pub(crate) fn route_and_execute(eng: &Engine, mut ev: Event, execute: &str) -> (bool, Event) {
    let collaborator = eng.collaborator();
    if !collaborator.dispatch(&mut ev) || matches!(ev.ret_value.as_str(), "" | "-" | "error") {
        return (false, ev);
    }
    let target = std::mem::take(&mut ev.ret_value);
    ev.rename(execute);
    ev.set("callto", target);
    ev.remove("error");
    ev.remove("reason");
    let ok = collaborator.dispatch(&mut ev);
    (ok, ev)
}

fn build_deliver(params: &Event, now_secs: u64) -> Option<String> {
    if params.value("operation").is_some_and(|op| op != "deliver") {
        info!("MT SMS: unknown operation '{}'", params.get_or("operation", ""));
        return None;
    }
    if let Some(enc) = params.value("text.encoding") {
        if !enc.eq_ignore_ascii_case("gsm7bit") {
            info!("MT SMS: unknown encoding '{}'", enc);
            return None;
        }
    }
    let deliver = MtDeliver {
        caller: params.get_or("caller", ""),
        caller_plan: params.get_or("callernumplan", ""),
        caller_nature: params.get_or("callernumtype", ""),
        sms_caller: params.get_or("sms.caller", ""),
        sms_caller_plan: params.get_or("sms.caller.plan", ""),
        sms_caller_nature: params.get_or("sms.caller.nature", ""),
        text: params.get_or("text", ""),
        smsc_timestamp: params.get_int("smsc.timestamp", now_secs as i64, 0, i64::MAX),
        smsc_tz: params.get_int("smsc.tz", 0, 0, 255) as u8,
    };
    match rp::build_mt_deliver(&deliver) {
        Ok(rpdu) => Some(rpdu),
        Err(e) => {
            info!("MT SMS: {}", e);
            None
        }
    }
}
