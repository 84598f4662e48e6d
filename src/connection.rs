//! Logical radio connections multiplexed over the signalling transport.
//!
//! Every asynchronous activity bound to a connection holds a [`ConnUsage`]
//! guard. While any guard is alive the connection has no idle deadline;
//! dropping the last one arms it. The registry sweep removes connections
//! whose deadline passed.
//!
//! Lock order: registry, then connection. Guards must never be dropped while
//! the lock of the connection they refer to is held.

use crate::clock::Clock;
use crate::message::{Message, Primitive};
use crate::pdu::Pdu;
use crate::signalling::Signalling;
use crate::sms::SmsInfo;
use crate::tid::Tid;
use crate::ue::Ue;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

pub const MAX_SAPI: u8 = 3;
const SAPI_SDCCH_FLAG: u8 = 0x80;

/// Shared idle timeout settings and the earliest pending deadline.
pub struct IdlePolicy {
    idle_ms: u64,
    idle_mt_sms_ms: u64,
    next_check: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl IdlePolicy {
    pub fn new(idle_ms: u64, idle_mt_sms_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            idle_ms,
            idle_mt_sms_ms,
            next_check: AtomicU64::new(0),
            clock,
        }
    }

    /// Lower the next sweep time to `deadline`.
    pub fn schedule(&self, deadline: u64) {
        if deadline == 0 {
            return;
        }
        let _ = self
            .next_check
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                (cur == 0 || deadline < cur).then_some(deadline)
            });
    }

    pub fn next_check(&self) -> Option<u64> {
        match self.next_check.load(Ordering::SeqCst) {
            0 => None,
            t => Some(t),
        }
    }

    /// Claim a due sweep, clearing the pending check.
    fn claim_due(&self, now: u64) -> bool {
        self.next_check
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                (cur != 0 && cur <= now).then_some(0)
            })
            .is_ok()
    }
}

pub struct ConnInner {
    pub ue: Option<Arc<Ue>>,
    /// Request parked until an identity response arrives.
    pub pending: Option<Pdu>,
    /// The single non-call transaction slot.
    pub ss: Option<Tid>,
    pub sms: Vec<SmsInfo>,
    usage: u32,
    timeout: Option<u64>,
    mt_sms: bool,
    sapi_up: u8,
    traffic: u8,
    wait_for_traffic: u8,
}

pub struct Connection {
    id: u16,
    policy: Arc<IdlePolicy>,
    inner: Mutex<ConnInner>,
}

pub type ConnHandle = Arc<Connection>;

impl Connection {
    fn new(id: u16, policy: Arc<IdlePolicy>) -> Self {
        // idle until something uses it
        let deadline = policy.clock.now_ms() + policy.idle_ms;
        policy.schedule(deadline);
        Self {
            id,
            policy,
            inner: Mutex::new(ConnInner {
                ue: None,
                pending: None,
                ss: None,
                sms: Vec::new(),
                usage: 0,
                timeout: Some(deadline),
                mt_sms: false,
                sapi_up: 1,
                traffic: 0,
                wait_for_traffic: 0,
            }),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, ConnInner> {
        self.inner.lock()
    }

    pub fn ue(&self) -> Option<Arc<Ue>> {
        self.inner.lock().ue.clone()
    }

    /// Bind a UE. Fails when a different UE is already bound.
    pub fn set_ue(&self, ue: &Arc<Ue>) -> bool {
        let mut inner = self.inner.lock();
        match &inner.ue {
            None => {
                debug!("Connection {} set UE imsi={} tmsi={}", self.id, ue.imsi(), ue.tmsi());
                inner.ue = Some(Arc::clone(ue));
                true
            }
            Some(cur) if Arc::ptr_eq(cur, ue) => true,
            Some(cur) => {
                warn!(
                    "Can't replace UE on connection {}: existing imsi={} new imsi={}",
                    self.id,
                    cur.imsi(),
                    ue.imsi()
                );
                false
            }
        }
    }

    /// Park a request. Only one may be pending.
    pub fn stash(&self, pdu: Pdu) -> bool {
        let mut inner = self.inner.lock();
        if inner.pending.is_some() {
            return false;
        }
        inner.pending = Some(pdu);
        true
    }

    pub fn take_pending(&self) -> Option<Pdu> {
        self.inner.lock().pending.take()
    }

    pub fn has_pending(&self) -> bool {
        self.inner.lock().pending.is_some()
    }

    pub fn take_ss(&self) -> Option<Tid> {
        self.inner.lock().ss.take()
    }

    pub fn has_ss(&self) -> bool {
        self.inner.lock().ss.is_some()
    }

    pub fn ss_id(&self) -> Option<String> {
        self.inner.lock().ss.as_ref().map(|t| t.id.clone())
    }

    /// Take a usage reference for this connection.
    pub fn acquire(self: &Arc<Self>, mt_sms: bool) -> ConnUsage {
        let mut inner = self.inner.lock();
        self.set_usage_locked(&mut inner, true, mt_sms);
        ConnUsage {
            conn: Arc::downgrade(self),
        }
    }

    fn release(&self) {
        let mut inner = self.inner.lock();
        self.set_usage_locked(&mut inner, false, false);
    }

    fn set_usage_locked(&self, inner: &mut ConnInner, on: bool, mt_sms: bool) {
        if on {
            inner.usage += 1;
            if mt_sms {
                inner.mt_sms = true;
            }
        } else if inner.usage > 0 {
            inner.usage -= 1;
        }
        if inner.usage > 0 {
            inner.timeout = None;
        } else if inner.timeout.is_none() {
            // the longer idle time applies once, after the MT SMS use
            let idle = if std::mem::take(&mut inner.mt_sms) {
                self.policy.idle_mt_sms_ms
            } else {
                self.policy.idle_ms
            };
            let deadline = self.policy.clock.now_ms() + idle;
            inner.timeout = Some(deadline);
            self.policy.schedule(deadline);
        }
    }

    pub fn usage(&self) -> u32 {
        self.inner.lock().usage
    }

    pub fn idle_deadline(&self) -> Option<u64> {
        self.inner.lock().timeout
    }

    pub fn traffic(&self) -> u8 {
        self.inner.lock().traffic
    }

    pub fn waiting_for_traffic(&self) -> bool {
        self.inner.lock().wait_for_traffic != 0
    }

    /// Request a traffic channel in `mode`. Returns true when it is active.
    pub fn start_traffic(&self, mode: u8, sig: &Signalling) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.traffic == mode {
                return true;
            }
            if inner.wait_for_traffic == mode {
                return false;
            }
            inner.wait_for_traffic = mode;
        }
        sig.send(&Message::new(Primitive::StartMedia, mode, Some(self.id)));
        debug!("Connection {} waiting for traffic channel mode={}", self.id, mode);
        false
    }

    pub fn start_traffic_rsp(&self, ok: bool) {
        let mut inner = self.inner.lock();
        if inner.wait_for_traffic == inner.traffic {
            return;
        }
        debug!(
            "Connection {} traffic channel set {} mode={}",
            self.id,
            if ok { "succeeded" } else { "failed" },
            inner.wait_for_traffic
        );
        if ok {
            inner.traffic = inner.wait_for_traffic;
        }
        inner.wait_for_traffic = 0;
    }

    /// Make sure `sapi` is up.
    ///
    /// Returns the info byte to use when it is, `None` after requesting its
    /// establishment or when it cannot be started now.
    pub fn start_sapi(&self, sapi: u8, sig: &Signalling) -> Option<u8> {
        if sapi == 0 {
            return Some(0);
        }
        if sapi > MAX_SAPI {
            return None;
        }
        let info = {
            let inner = self.inner.lock();
            if inner.wait_for_traffic != 0 {
                return None;
            }
            if (inner.sapi_up >> sapi) & 1 != 0 {
                let on_sdcch = (inner.sapi_up >> (4 + sapi)) & 1 != 0;
                return Some(if on_sdcch { sapi | SAPI_SDCCH_FLAG } else { sapi });
            }
            if inner.traffic != 0 {
                sapi | SAPI_SDCCH_FLAG
            } else {
                sapi
            }
        };
        sig.send(&Message::new(Primitive::EstablishSapi, info, Some(self.id)));
        None
    }

    /// Record a SAPI establishment notification.
    pub fn sapi_establish(&self, info: u8) {
        if info == 0 || info == SAPI_SDCCH_FLAG {
            return;
        }
        let n = info & 0x0f;
        if n > MAX_SAPI {
            return;
        }
        let mut inner = self.inner.lock();
        let bit = 1u8 << n;
        inner.sapi_up |= bit;
        if info & SAPI_SDCCH_FLAG != 0 {
            inner.sapi_up |= bit << 4;
        } else {
            inner.sapi_up &= !(bit << 4);
        }
        debug!("Connection {} sapi establish {} state {:#04x}", self.id, info, inner.sapi_up);
    }

    pub fn sapi_state(&self) -> u8 {
        self.inner.lock().sapi_up
    }
}

/// Usage reference on a connection, released on drop.
pub struct ConnUsage {
    conn: Weak<Connection>,
}

impl ConnUsage {
    pub fn conn_id(&self) -> Option<u16> {
        self.conn.upgrade().map(|c| c.id)
    }
}

impl Drop for ConnUsage {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.release();
        }
    }
}

impl std::fmt::Debug for ConnUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnUsage").field("conn", &self.conn_id()).finish()
    }
}

/// Work found by an idle sweep, to be carried out without the registry lock.
#[derive(Default)]
pub struct Expired {
    pub ss: Vec<(u16, Tid)>,
    pub conns: Vec<u16>,
}

pub struct ConnRegistry {
    conns: Mutex<Vec<ConnHandle>>,
    policy: Arc<IdlePolicy>,
}

impl ConnRegistry {
    pub fn new(policy: Arc<IdlePolicy>) -> Self {
        Self {
            conns: Mutex::new(Vec::new()),
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, id: u16) -> Option<ConnHandle> {
        self.conns.lock().iter().find(|c| c.id == id).cloned()
    }

    /// Returns the connection and whether it was created by this call.
    pub fn find_or_create(&self, id: u16) -> (ConnHandle, bool) {
        let mut conns = self.conns.lock();
        if let Some(c) = conns.iter().find(|c| c.id == id) {
            return (Arc::clone(c), false);
        }
        let conn = Arc::new(Connection::new(id, Arc::clone(&self.policy)));
        conns.push(Arc::clone(&conn));
        debug!("Added connection {}", id);
        (conn, true)
    }

    pub fn find_by_ue(&self, ue: &Arc<Ue>) -> Option<ConnHandle> {
        self.conns
            .lock()
            .iter()
            .find(|c| c.lock().ue.as_ref().is_some_and(|u| Arc::ptr_eq(u, ue)))
            .cloned()
    }

    /// Connection whose SS slot holds session `ss_id`.
    pub fn find_by_ss(&self, ss_id: &str) -> Option<ConnHandle> {
        self.conns
            .lock()
            .iter()
            .find(|c| c.lock().ss.as_ref().is_some_and(|t| t.id == ss_id))
            .cloned()
    }

    pub fn remove(&self, id: u16) -> Option<ConnHandle> {
        let mut conns = self.conns.lock();
        let pos = conns.iter().position(|c| c.id == id)?;
        debug!("Removing connection {}", id);
        Some(conns.remove(pos))
    }

    pub fn take_all(&self) -> Vec<ConnHandle> {
        std::mem::take(&mut *self.conns.lock())
    }

    pub fn ids(&self) -> Vec<u16> {
        self.conns.lock().iter().map(|c| c.id).collect()
    }

    /// Empty every SS slot.
    pub fn take_all_ss(&self) -> Vec<(u16, Tid)> {
        let conns = self.conns.lock();
        conns
            .iter()
            .filter_map(|c| c.take_ss().map(|t| (c.id, t)))
            .collect()
    }

    pub fn schedule_check(&self, deadline: u64) {
        self.policy.schedule(deadline);
    }

    pub fn next_check(&self) -> Option<u64> {
        self.policy.next_check()
    }

    /// Collect expired SS sessions and idle connections.
    pub fn collect_expired(&self, now: u64) -> Expired {
        let mut out = Expired::default();
        let conns = self.conns.lock();
        if !self.policy.claim_due(now) {
            return out;
        }
        for c in conns.iter() {
            let mut inner = c.lock();
            if let Some(deadline) = inner.ss.as_ref().map(|t| t.timeout).filter(|t| *t != 0) {
                if deadline <= now {
                    if let Some(ss) = inner.ss.take() {
                        out.ss.push((c.id, ss));
                    }
                } else {
                    self.policy.schedule(deadline);
                }
            }
            match inner.timeout {
                Some(t) if t <= now => out.conns.push(c.id),
                Some(t) => self.policy.schedule(t),
                None => {}
            }
        }
        out
    }
}
