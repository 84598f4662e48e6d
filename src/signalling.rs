//! Signalling session with the radio peer: handshake, heartbeat and the
//! framed send path shared by every protocol handler.

use crate::clock::Clock;
use crate::codec::L3Codec;
use crate::config::BtsConfig;
use crate::connection::{ConnRegistry, IdlePolicy};
use crate::error::{FrameError, TransportError};
use crate::message::{Message, Primitive};
use crate::pdu::Pdu;
use crate::transport::Transport;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Started,
    WaitHandshake,
    Running,
    Closing,
}

/// Outcome of session processing, acted upon by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    Restart,
    Fatal,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SignallingStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub parse_errors: u64,
    pub send_failures: u64,
    pub heartbeats_sent: u64,
    pub discarded: u64,
}

struct Session {
    state: SessionState,
    timeout: Option<u64>,
    hb_time: Option<u64>,
}

pub struct Signalling {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn L3Codec>,
    clock: Arc<dyn Clock>,
    registry: ConnRegistry,
    session: Mutex<Session>,
    stats: Mutex<SignallingStats>,
    handshake_ms: u64,
    ping_ms: u64,
    hb_timeout_ms: u64,
}

impl Signalling {
    pub fn new(
        config: &BtsConfig,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn L3Codec>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let policy = IdlePolicy::new(config.conn_idle_ms, config.conn_idle_mt_sms_ms, Arc::clone(&clock));
        Self {
            transport,
            codec,
            clock,
            registry: ConnRegistry::new(Arc::new(policy)),
            session: Mutex::new(Session {
                state: SessionState::Idle,
                timeout: None,
                hb_time: None,
            }),
            stats: Mutex::new(SignallingStats::default()),
            handshake_ms: config.handshake_timeout_ms,
            ping_ms: config.ping_interval_ms,
            hb_timeout_ms: config.heartbeat_timeout_ms,
        }
    }

    pub fn registry(&self) -> &ConnRegistry {
        &self.registry
    }

    pub fn codec(&self) -> &dyn L3Codec {
        self.codec.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub fn stats(&self) -> SignallingStats {
        self.stats.lock().clone()
    }

    fn change_state(session: &mut Session, state: SessionState) {
        if session.state == state {
            return;
        }
        debug!("Signalling state {:?} -> {:?}", session.state, state);
        session.state = state;
        if matches!(state, SessionState::Idle | SessionState::Closing) {
            session.timeout = None;
            session.hb_time = None;
        }
    }

    /// Begin a session: wait for the peer handshake.
    pub fn start(&self) {
        let now = self.clock.now_ms();
        let mut s = self.session.lock();
        Self::change_state(&mut s, SessionState::Started);
        Self::change_state(&mut s, SessionState::WaitHandshake);
        s.timeout = Some(now + self.handshake_ms);
        s.hb_time = None;
        info!("Signalling started, waiting {}ms for handshake", self.handshake_ms);
    }

    pub fn stop(&self) {
        let mut s = self.session.lock();
        Self::change_state(&mut s, SessionState::Idle);
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.transport.recv(buf)
    }

    pub fn parse(&self, data: &[u8]) -> Result<Message, FrameError> {
        let res = Message::parse(data, self.codec.as_ref());
        let mut stats = self.stats.lock();
        stats.frames_received += 1;
        if !matches!(&res, Ok(m) if !m.error) {
            stats.parse_errors += 1;
        }
        res
    }

    /// Any received frame proves the peer alive.
    pub fn note_activity(&self) {
        let now = self.clock.now_ms();
        let mut s = self.session.lock();
        if s.state == SessionState::Running {
            s.timeout = Some(now + self.hb_timeout_ms);
        }
    }

    pub fn note_discarded(&self) {
        self.stats.lock().discarded += 1;
    }

    /// Build and send a message. Failures are logged and counted.
    pub fn send(&self, msg: &Message) -> bool {
        let frame = match msg.build(self.codec.as_ref()) {
            Ok(f) => f,
            Err(e) => {
                warn!("Failed to build {} ({}): {}", msg.primitive.name(), msg.primitive.code(), e);
                self.stats.lock().send_failures += 1;
                return false;
            }
        };
        if let Err(e) = self.transport.send(&frame) {
            warn!("Failed to send {}: {}", msg.primitive.name(), e);
            self.stats.lock().send_failures += 1;
            return false;
        }
        trace!("Sent {} conn={:?} info={}", msg.primitive.name(), msg.conn_id, msg.info);
        self.stats.lock().frames_sent += 1;
        let now = self.clock.now_ms();
        let mut s = self.session.lock();
        if s.state == SessionState::Running {
            s.hb_time = Some(now + self.ping_ms);
        }
        true
    }

    pub fn send_l3(&self, conn_id: u16, pdu: Pdu, info: u8) -> bool {
        self.send(&Message::l3(info, conn_id, pdu))
    }

    pub fn send_rr_status(&self, conn_id: u16, cause: u8) -> bool {
        let pdu = Pdu::l3("RRM", "RRStatus").with_ie_text("RRCause", &cause.to_string());
        self.send_l3(conn_id, pdu, 0)
    }

    /// Handle the peer handshake. `accept` asks the driver whether the
    /// session may run.
    pub fn handshake<F>(&self, info: u8, accept: F) -> Verdict
    where
        F: FnOnce() -> bool,
    {
        if self.state() != SessionState::WaitHandshake {
            debug!("Unexpected handshake");
            return Verdict::Ok;
        }
        if info != 0 {
            error!("Unknown version {} in handshake", info);
            return Verdict::Fatal;
        }
        if !accept() {
            return Verdict::Restart;
        }
        {
            let now = self.clock.now_ms();
            let mut s = self.session.lock();
            if s.state != SessionState::WaitHandshake {
                return Verdict::Ok;
            }
            Self::change_state(&mut s, SessionState::Running);
            s.timeout = Some(now + self.hb_timeout_ms);
            s.hb_time = Some(now + self.ping_ms);
        }
        if self.send(&Message::signal(Primitive::Handshake, 0)) {
            info!("Signalling handshake done");
            Verdict::Ok
        } else {
            Verdict::Restart
        }
    }

    /// Drive handshake and heartbeat timers.
    pub fn check_timers(&self, now: u64) -> Verdict {
        let mut s = self.session.lock();
        if matches!(s.state, SessionState::Idle | SessionState::Closing) {
            return Verdict::Ok;
        }
        if s.timeout.is_some_and(|t| t <= now) {
            warn!(
                "Timeout while waiting for {}",
                if s.state == SessionState::WaitHandshake { "handshake" } else { "heartbeat" }
            );
            Self::change_state(&mut s, SessionState::Closing);
            return Verdict::Restart;
        }
        if s.hb_time.is_some_and(|t| t <= now) {
            drop(s);
            let ok = self.transport.send(&[Primitive::Heartbeat.code(), 0]).is_ok();
            let mut s = self.session.lock();
            if ok {
                trace!("Sent heartbeat");
                self.stats.lock().heartbeats_sent += 1;
                if s.state == SessionState::Running {
                    s.hb_time = Some(now + self.ping_ms);
                }
            } else if s.state == SessionState::Running {
                warn!("Failed to send heartbeat");
                Self::change_state(&mut s, SessionState::Closing);
                return Verdict::Restart;
            }
        }
        Verdict::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::codec::JsonCodec;
    use crate::transport::MemoryTransport;

    fn session() -> (Signalling, Arc<MemoryTransport>, Arc<ManualClock>) {
        let transport = Arc::new(MemoryTransport::new());
        let clock = Arc::new(ManualClock::new(0));
        let sig = Signalling::new(
            &BtsConfig::default(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(JsonCodec::new()),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        (sig, transport, clock)
    }

    #[test]
    fn test_handshake_timeout() {
        let (sig, _t, _clock) = session();
        sig.start();
        assert_eq!(sig.state(), SessionState::WaitHandshake);
        assert_eq!(sig.check_timers(59_999), Verdict::Ok);
        assert_eq!(sig.check_timers(60_000), Verdict::Restart);
        assert_eq!(sig.state(), SessionState::Closing);
    }

    #[test]
    fn test_handshake_then_heartbeat() {
        let (sig, t, clock) = session();
        sig.start();
        assert_eq!(sig.handshake(0, || true), Verdict::Ok);
        assert_eq!(sig.state(), SessionState::Running);
        assert_eq!(t.take_sent(), vec![vec![128, 0]]);
        clock.set(30_000);
        assert_eq!(sig.check_timers(30_000), Verdict::Ok);
        assert_eq!(t.take_sent(), vec![vec![132, 0]]);
        // no traffic from the peer
        assert_eq!(sig.check_timers(60_000), Verdict::Restart);
    }

    #[test]
    fn test_handshake_refusals() {
        let (sig, t, _clock) = session();
        assert_eq!(sig.handshake(0, || true), Verdict::Ok);
        assert_eq!(sig.state(), SessionState::Idle);
        sig.start();
        assert_eq!(sig.handshake(2, || true), Verdict::Fatal);
        assert_eq!(sig.handshake(0, || false), Verdict::Restart);
        assert!(t.take_sent().is_empty());
    }

    #[test]
    fn test_heartbeat_send_failure_restarts() {
        let (sig, t, _clock) = session();
        sig.start();
        sig.handshake(0, || true);
        t.set_fail_sends(true);
        assert_eq!(sig.check_timers(30_000), Verdict::Restart);
    }
}
