//! The engine context: owns every subsystem and routes frames, timers and
//! collaborator requests between them.

use crate::cc::{CallManager, CcStats};
use crate::clock::Clock;
use crate::codec::L3Codec;
use crate::collaborator::{Collaborator, Event};
use crate::config::BtsConfig;
use crate::connection::ConnHandle;
use crate::error::{BtsError, Result};
use crate::message::{Message, Primitive};
use crate::mm::{MmStats, MobilityManager};
use crate::pdu::{Pdu, PROTO_CC, PROTO_MM, PROTO_RRM, PROTO_SMS, PROTO_SS};
use crate::signalling::{SessionState, Signalling, SignallingStats, Verdict};
use crate::sms::{MtSmsTicket, SmsManager, SmsStats};
use crate::supervisor::{DriverState, Supervisor, SupervisorStats};
use crate::tid::Tid;
use crate::transport::{Transport, MAX_FRAME_SIZE};
use crate::ue::{Ue, UeDirectory};
use crate::ussd::{UssdManager, UssdStats};
use crate::workers::WorkerPool;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, trace, warn};

/// External capabilities handed to [`Engine::new`].
pub struct Capabilities {
    pub transport: Arc<dyn Transport>,
    pub codec: Arc<dyn L3Codec>,
    pub collaborator: Arc<dyn Collaborator>,
    pub clock: Arc<dyn Clock>,
    pub workers: WorkerPool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub state: DriverState,
    pub session: SessionState,
    pub connections: usize,
    pub subscribers: usize,
    pub workers_active: usize,
    pub workers_spawned: u64,
    pub signalling: SignallingStats,
    pub supervisor: SupervisorStats,
    pub mm: MmStats,
    pub cc: CcStats,
    pub sms: SmsStats,
    pub ussd: UssdStats,
}

pub struct Engine {
    me: Weak<Engine>,
    config: BtsConfig,
    clock: Arc<dyn Clock>,
    collaborator: Arc<dyn Collaborator>,
    workers: WorkerPool,
    sig: Signalling,
    supervisor: Supervisor,
    mm: MobilityManager,
    cc: CallManager,
    sms: SmsManager,
    ussd: UssdManager,
}

impl Engine {
    pub fn new(mut config: BtsConfig, caps: Capabilities) -> Arc<Self> {
        config.clamp();
        let Capabilities {
            transport,
            codec,
            collaborator,
            clock,
            workers,
        } = caps;
        let directory = UeDirectory::new(config.ue_file.clone(), config.save_tmsi);
        info!(
            "Engine for LAI {} with {} known subscriber(s)",
            config.lai.key(),
            directory.len()
        );
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            sig: Signalling::new(&config, transport, codec, Arc::clone(&clock)),
            supervisor: Supervisor::new(config.restart_delay_ms, config.restart_max, Arc::clone(&clock)),
            mm: MobilityManager::new(directory, config.lai.clone(), config.ask_imei, config.tmsi_expire_secs),
            cc: CallManager::new(config.accept_calls, config.t305_ms, config.t308_ms, config.t313_ms),
            sms: SmsManager::new(),
            ussd: UssdManager::new(config.ussd_timeout_ms),
            config,
            clock,
            collaborator,
            workers,
        })
    }

    pub fn config(&self) -> &BtsConfig {
        &self.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn collaborator(&self) -> &dyn Collaborator {
        self.collaborator.as_ref()
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    pub fn sig(&self) -> &Signalling {
        &self.sig
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn mm(&self) -> &MobilityManager {
        &self.mm
    }

    pub fn cc(&self) -> &CallManager {
        &self.cc
    }

    pub fn sms(&self) -> &SmsManager {
        &self.sms
    }

    pub fn ussd(&self) -> &UssdManager {
        &self.ussd
    }

    pub fn state(&self) -> DriverState {
        self.supervisor.state()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            state: self.supervisor.state(),
            session: self.sig.state(),
            connections: self.sig.registry().len(),
            subscribers: self.mm.directory().len(),
            workers_active: self.workers.active_count(),
            workers_spawned: self.workers.spawned_count(),
            signalling: self.sig.stats(),
            supervisor: self.supervisor.stats(),
            mm: self.mm.stats(),
            cc: self.cc.stats(),
            sms: self.sms.stats(),
            ussd: self.ussd.stats(),
        }
    }

    /// Run `work` off the signalling path. `done` gets the engine back and
    /// whether the session that started the work is still the live one; a
    /// cancelled worker drops its result.
    pub(crate) fn spawn_worker<W, C>(&self, name: &str, work: W) -> bool
    where
        W: FnOnce(&Engine) -> C + Send + 'static,
        C: FnOnce(&Engine, bool),
    {
        let Some(me) = self.me.upgrade() else {
            return false;
        };
        let epoch = self.supervisor.epoch();
        let worker = name.to_string();
        self.workers.spawn(name, move |token| {
            let done = work(&me);
            if token.is_cancelled() {
                debug!("Worker '{}' cancelled, result discarded", worker);
                return;
            }
            let current = me.supervisor.is_current(epoch);
            if !current {
                debug!("Worker '{}' finished after restart (epoch {})", worker, epoch);
            }
            done(&me, current);
        })
    }

    // Lifecycle

    /// Start a signalling session. Restarts are counted; once exhausted the
    /// engine stays `Stopped`.
    pub fn start(&self) -> DriverState {
        if !matches!(self.supervisor.state(), DriverState::Idle | DriverState::Stopped) {
            self.stop();
        }
        if !self.supervisor.begin_start() {
            return self.supervisor.state();
        }
        self.workers.resume();
        self.sig.start();
        self.supervisor.state()
    }

    /// Tear down every session object and go back to Idle.
    pub fn stop(&self) {
        let active = self.supervisor.state() != DriverState::Idle;
        if active {
            info!("Stopping in state {}", self.supervisor.state().name());
        }
        self.ussd.drop_parked(self, "failure");
        self.cc.hangup_all(self, "interworking");
        self.cc.clear_terminated();
        self.sms.terminate_all(self, "failure");
        for id in self.sig.registry().ids() {
            self.drop_conn(id, false);
        }
        self.sig.stop();
        self.mm.directory().save_if_dirty();
        self.supervisor.set_idle();
    }

    /// Stop and schedule a new start after `delay_ms`, or after the backoff
    /// delay.
    pub fn restart(&self, delay_ms: Option<u64>) {
        self.stop();
        match self.supervisor.request_restart(delay_ms) {
            Some(delay) => info!("Restarting in {}ms", delay),
            None => warn!("Restart requested while stopped for good"),
        }
    }

    /// Fatal error: stop without scheduling a restart.
    pub fn stop_no_restart(&self) {
        error!("Fatal signalling error, not restarting");
        self.supervisor.set_fatal();
        self.stop();
    }

    fn apply(&self, verdict: Verdict) {
        match verdict {
            Verdict::Ok => {}
            Verdict::Restart => self.restart(None),
            Verdict::Fatal => self.stop_no_restart(),
        }
    }

    /// Periodic driver: restart schedule, session timers, idle connections
    /// and per transaction timers.
    pub fn tick(&self) {
        let now = self.clock.now_ms();
        if self.supervisor.restart_due(now) {
            self.start();
        }
        self.apply(self.sig.check_timers(now));
        let expired = self.sig.registry().collect_expired(now);
        for (conn_id, ss) in expired.ss {
            let to_ms = self.sig.registry().find(conn_id).is_some();
            self.drop_ss(conn_id, ss, to_ms, true, "timeout");
        }
        for conn_id in expired.conns {
            debug!("Connection {} idle timeout", conn_id);
            self.drop_conn(conn_id, true);
        }
        self.cc.check_timers(self, now);
        self.sms.check_timeouts(self, now);
        self.ussd.check_timeouts(self, now);
        self.mm.check_timers(self.clock.now_secs());
    }

    // Frames

    /// Wait for one frame and handle it. Returns whether a frame arrived.
    pub fn receive_once(&self) -> Result<bool> {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        match self.sig.recv(&mut buf) {
            Ok(0) => Ok(false),
            Ok(n) => {
                self.handle_frame(&buf[..n]);
                Ok(true)
            }
            Err(e) => {
                if self.sig.state() != SessionState::Idle {
                    error!("Signalling receive failed: {}", e);
                    self.restart(None);
                }
                Err(e.into())
            }
        }
    }

    /// Handle every frame already waiting. Returns how many were handled.
    pub fn poll(&self) -> Result<usize> {
        let mut handled = 0;
        while self.receive_once()? {
            handled += 1;
        }
        Ok(handled)
    }

    pub fn handle_frame(&self, data: &[u8]) {
        let msg = match self.sig.parse(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping invalid frame: {}", e);
                return;
            }
        };
        self.sig.note_activity();
        self.dispatch(msg);
    }

    fn dispatch(&self, msg: Message) {
        trace!("Recv {} conn={:?} info={}", msg.primitive.name(), msg.conn_id, msg.info);
        match msg.primitive {
            Primitive::Heartbeat => {}
            Primitive::Handshake => {
                let verdict = self.sig.handshake(msg.info, || self.supervisor.handshake_done());
                self.apply(verdict);
            }
            _ if !self.sig.is_running() => {
                debug!("Discarding {} in state {:?}", msg.primitive.name(), self.sig.state());
                self.sig.note_discarded();
            }
            _ if msg.error => self.sig.note_discarded(),
            Primitive::L3Message => self.handle_l3(msg.conn_id(), msg.info, msg.pdu),
            Primitive::ConnLost => self.drop_conn(msg.conn_id(), false),
            Primitive::MediaStarted => self.handle_media_rsp(msg.conn_id(), true),
            Primitive::MediaError => self.handle_media_rsp(msg.conn_id(), false),
            Primitive::EstablishSapi => self.handle_sapi_established(msg.conn_id(), msg.info),
            Primitive::RadioReady => {
                if self.supervisor.radio_ready() {
                    info!("Radio is up");
                } else {
                    self.restart(None);
                }
            }
            other => debug!("Unhandled {} ({})", other.name(), other.code()),
        }
    }

    fn handle_l3(&self, conn_id: u16, info: u8, pdu: Option<Pdu>) {
        let Some(pdu) = pdu else {
            debug!("Empty L3 message on connection {}", conn_id);
            return;
        };
        let registry = self.sig.registry();
        match pdu.tag.as_str() {
            PROTO_MM => {
                let (conn, _) = registry.find_or_create(conn_id);
                self.mm.handle_pdu(self, &conn, info, pdu);
            }
            PROTO_RRM => self.handle_rrm(conn_id, &pdu),
            tag @ (PROTO_CC | PROTO_SMS | PROTO_SS) => {
                let Some(conn) = registry.find(conn_id) else {
                    info!("Received {} on unknown connection {}", tag, conn_id);
                    self.drop_conn(conn_id, true);
                    return;
                };
                match tag {
                    PROTO_CC => self.cc.handle_pdu(self, &conn, &pdu),
                    PROTO_SMS => self.sms.handle_pdu(self, &conn, info, &pdu),
                    _ => self.ussd.handle_pdu(self, &conn, info, &pdu),
                }
            }
            other => warn!("Unhandled L3 protocol '{}' on connection {}", other, conn_id),
        }
    }

    fn handle_rrm(&self, conn_id: u16, pdu: &Pdu) {
        match pdu.message_type() {
            Some("PagingResponse") => {
                let (conn, created) = self.sig.registry().find_or_create(conn_id);
                if !self.mm.handle_paging_response(self, &conn, pdu) && created {
                    self.drop_conn(conn_id, true);
                }
            }
            other => debug!("Unhandled RRM {:?} on connection {}", other, conn_id),
        }
    }

    fn handle_media_rsp(&self, conn_id: u16, ok: bool) {
        let Some(conn) = self.sig.registry().find(conn_id) else {
            debug!("Media response for unknown connection {}", conn_id);
            return;
        };
        conn.start_traffic_rsp(ok);
        self.cc.media_rsp(self, conn_id, ok);
        self.sms.check_ue(self, conn.ue().as_ref());
        self.ussd.check_conn(self, &conn);
    }

    fn handle_sapi_established(&self, conn_id: u16, info: u8) {
        let Some(conn) = self.sig.registry().find(conn_id) else {
            debug!("SAPI established on unknown connection {}", conn_id);
            return;
        };
        conn.sapi_establish(info);
        if let Some(ue) = conn.ue() {
            self.check_mt_service(&ue, &conn, false);
        }
    }

    /// A connection to `ue` is usable: start whatever waits for it.
    pub fn check_mt_service(&self, ue: &Arc<Ue>, conn: &ConnHandle, paging_rsp: bool) {
        self.cc.check_mt(self, ue, conn, paging_rsp);
        self.sms.check_ue(self, Some(ue));
        self.ussd.check_conn(self, conn);
    }

    // Connections

    /// Remove a connection and release everything bound to it.
    pub fn drop_conn(&self, conn_id: u16, notify_peer: bool) {
        let conn = self.sig.registry().remove(conn_id);
        if let Some(ss) = conn.as_ref().and_then(|c| c.take_ss()) {
            self.drop_ss(conn_id, ss, notify_peer, true, "net-out-of-order");
        }
        if notify_peer {
            self.sig.send(&Message::new(Primitive::ConnRelease, 0, Some(conn_id)));
        }
        drop(conn);
        self.cc.conn_released(self, conn_id);
        self.sms.conn_released(self, conn_id);
    }

    /// Release an SS session towards the MS and/or the network.
    pub fn drop_ss(&self, conn_id: u16, ss: Tid, to_ms: bool, to_net: bool, reason: &str) {
        self.ussd.drop_session(self, conn_id, ss, to_ms, to_net, reason);
    }

    // Collaborator requests

    /// Start an MT call. Returns the channel id.
    pub fn place_call(&self, dest: &str, params: &Event) -> Result<String> {
        self.cc.place_call(self, dest, params)
    }

    pub fn call_progress(&self, chan_id: &str, params: &Event) -> Result<()> {
        self.cc.call_progress(self, chan_id, params)
    }

    pub fn call_ringing(&self, chan_id: &str, params: &Event) -> Result<()> {
        self.cc.call_ringing(self, chan_id, params)
    }

    pub fn call_answered(&self, chan_id: &str, params: &Event) -> Result<()> {
        self.cc.call_answered(self, chan_id, params)
    }

    pub fn hangup_call(&self, chan_id: &str, reason: &str) -> Result<()> {
        self.cc.hangup_call(self, chan_id, reason)
    }

    /// Queue an MT short message. The ticket resolves once it is delivered
    /// or failed.
    pub fn submit_mt_sms(&self, dest: &str, params: &Event) -> Result<MtSmsTicket> {
        self.sms.submit(self, dest, params)
    }

    /// Start an MT USSD session. Returns the session id.
    pub fn ussd_execute(&self, dest: &str, params: &Event) -> Result<String> {
        self.ussd.execute(self, dest, params)
    }

    pub fn ussd_update(&self, params: &Event) -> Result<()> {
        self.ussd.update(self, params)
    }

    pub fn ussd_finalize(&self, params: &Event) -> Result<()> {
        self.ussd.finalize(self, params)
    }

    /// Refuse work while the radio is down.
    pub fn ensure_radio(&self) -> Result<()> {
        if self.supervisor.is_radio_up() {
            Ok(())
        } else {
            Err(BtsError::RadioNotReady)
        }
    }
}
