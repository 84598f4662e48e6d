//! Shared harness: an engine wired to an in-memory transport, a manual
//! clock, inline workers and a collaborator that records everything.
#![allow(dead_code)]

use bts_signal::clock::{Clock, ManualClock};
use bts_signal::collaborator::{Collaborator, Event};
use bts_signal::pdu::{mobile_identity, Pdu};
use bts_signal::transport::{MemoryTransport, Transport};
use bts_signal::ue::Ue;
use bts_signal::workers::{WorkerMode, WorkerPool};
use bts_signal::{BtsConfig, Capabilities, Engine, JsonCodec, L3Codec, Message, Primitive};
use parking_lot::Mutex;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

pub const IMSI: &str = "001010000000001";
pub const START_MS: u64 = 1_000_000;

/// Collaborator double: answers dispatches from its settings and records
/// every request and notification.
pub struct RecordingCollaborator {
    pub register_ok: Mutex<bool>,
    pub register_params: Mutex<Vec<(String, String)>>,
    /// When set, `user.register` blocks until the sender fires.
    pub register_gate: Mutex<Option<Receiver<()>>>,
    /// `ret_value` of `call.route`; `None` fails the route.
    pub route_target: Mutex<Option<String>>,
    pub execute_ok: Mutex<bool>,
    pub execute_params: Mutex<Vec<(String, String)>>,
    pub dispatched: Mutex<Vec<Event>>,
    pub enqueued: Mutex<Vec<Event>>,
}

impl Default for RecordingCollaborator {
    fn default() -> Self {
        Self {
            register_ok: Mutex::new(true),
            register_params: Mutex::new(Vec::new()),
            register_gate: Mutex::new(None),
            route_target: Mutex::new(Some("app/route".to_string())),
            execute_ok: Mutex::new(true),
            execute_params: Mutex::new(vec![("peerid".to_string(), "app/1".to_string())]),
            dispatched: Mutex::new(Vec::new()),
            enqueued: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingCollaborator {
    pub fn dispatched_named(&self, name: &str) -> Vec<Event> {
        self.dispatched.lock().iter().filter(|e| e.name == name).cloned().collect()
    }

    pub fn enqueued_named(&self, name: &str) -> Vec<Event> {
        self.enqueued.lock().iter().filter(|e| e.name == name).cloned().collect()
    }
}

impl Collaborator for RecordingCollaborator {
    fn dispatch(&self, event: &mut Event) -> bool {
        self.dispatched.lock().push(event.clone());
        match event.name.as_str() {
            "user.register" => {
                let gate = self.register_gate.lock().take();
                if let Some(gate) = gate {
                    let _ = gate.recv();
                }
                for (k, v) in self.register_params.lock().iter() {
                    event.set(k, v.clone());
                }
                *self.register_ok.lock()
            }
            "call.route" => match self.route_target.lock().clone() {
                Some(target) => {
                    event.ret_value = target;
                    true
                }
                None => {
                    event.set("error", "noroute");
                    false
                }
            },
            "call.execute" | "msg.execute" | "ussd.execute" => {
                for (k, v) in self.execute_params.lock().iter() {
                    event.set(k, v.clone());
                }
                *self.execute_ok.lock()
            }
            _ => false,
        }
    }

    fn enqueue(&self, event: Event) {
        self.enqueued.lock().push(event);
    }

    fn map_encode(&self, component: &Pdu) -> Result<String, String> {
        let json = serde_json::to_vec(component).map_err(|e| e.to_string())?;
        Ok(hex::encode(json))
    }

    fn map_decode(&self, facility: &str) -> Result<Pdu, String> {
        let raw = hex::decode(facility).map_err(|e| e.to_string())?;
        serde_json::from_slice(&raw).map_err(|e| e.to_string())
    }
}

pub fn test_config() -> BtsConfig {
    BtsConfig {
        ask_imei: false,
        ..BtsConfig::default()
    }
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub transport: Arc<MemoryTransport>,
    pub clock: Arc<ManualClock>,
    pub collaborator: Arc<RecordingCollaborator>,
    codec: JsonCodec,
    runtime: Option<tokio::runtime::Runtime>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: BtsConfig) -> Self {
        Self::build(config, WorkerPool::inline(), None)
    }

    /// Workers on a real blocking pool, for results that land after the
    /// caller returns.
    pub fn with_runtime() -> Self {
        let runtime = tokio::runtime::Runtime::new().expect("test runtime");
        let workers = WorkerPool::new(WorkerMode::Runtime(runtime.handle().clone()));
        Self::build(test_config(), workers, Some(runtime))
    }

    fn build(config: BtsConfig, workers: WorkerPool, runtime: Option<tokio::runtime::Runtime>) -> Self {
        let transport = Arc::new(MemoryTransport::new());
        let clock = Arc::new(ManualClock::new(START_MS));
        let collaborator = Arc::new(RecordingCollaborator::default());
        let engine = Engine::new(
            config,
            Capabilities {
                transport: Arc::clone(&transport) as Arc<dyn Transport>,
                codec: Arc::new(JsonCodec::new()),
                collaborator: Arc::clone(&collaborator) as Arc<dyn Collaborator>,
                clock: Arc::clone(&clock) as Arc<dyn Clock>,
                workers,
            },
        );
        Self {
            engine,
            transport,
            clock,
            collaborator,
            codec: JsonCodec::new(),
            runtime,
        }
    }

    /// Started, handshaken and radio ready, with the send log cleared.
    pub fn running() -> Self {
        let h = Self::new();
        h.bring_up();
        h
    }

    pub fn bring_up(&self) {
        self.engine.start();
        self.inject(&Message::signal(Primitive::Handshake, 0));
        self.inject_raw(&[Primitive::RadioReady.code(), 0]);
        self.transport.take_sent();
    }

    pub fn inject(&self, msg: &Message) {
        let frame = msg.build(&self.codec).expect("test frame must build");
        self.engine.handle_frame(&frame);
    }

    pub fn inject_raw(&self, frame: &[u8]) {
        self.engine.handle_frame(frame);
    }

    pub fn inject_l3(&self, conn_id: u16, pdu: Pdu) {
        self.inject_l3_info(conn_id, 0, pdu);
    }

    pub fn inject_l3_info(&self, conn_id: u16, info: u8, pdu: Pdu) {
        let frame = self.l3_frame(conn_id, info, &pdu);
        self.engine.handle_frame(&frame);
    }

    pub fn l3_frame(&self, conn_id: u16, info: u8, pdu: &Pdu) -> Vec<u8> {
        let mut frame = vec![0, info];
        frame.extend_from_slice(&conn_id.to_be_bytes());
        frame.extend_from_slice(&self.codec.encode(pdu).expect("test PDU must encode"));
        frame
    }

    pub fn inject_conn(&self, primitive: Primitive, conn_id: u16, info: u8) {
        let mut frame = vec![primitive.code(), info];
        frame.extend_from_slice(&conn_id.to_be_bytes());
        self.engine.handle_frame(&frame);
    }

    /// Everything sent since the last call, parsed back.
    pub fn sent(&self) -> Vec<Message> {
        self.transport
            .take_sent()
            .iter()
            .map(|f| Message::parse(f, &self.codec).expect("sent frame must parse"))
            .collect()
    }

    /// Sent L3 messages as `(conn_id, info, pdu)`.
    pub fn sent_l3(&self) -> Vec<(u16, u8, Pdu)> {
        self.sent()
            .into_iter()
            .filter_map(|m| {
                let conn_id = m.conn_id();
                m.pdu.map(|p| (conn_id, m.info, p))
            })
            .collect()
    }

    /// Wait for every background worker to finish.
    pub fn drain_workers(&self) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while self.engine.workers().active_count() > 0 {
            assert!(std::time::Instant::now() < deadline, "workers did not finish");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    pub fn advance(&self, ms: u64) {
        self.clock.advance(ms);
        self.engine.tick();
    }

    pub fn ue(&self, imsi: &str) -> Arc<Ue> {
        self.engine
            .mm()
            .directory()
            .find_by_imsi(imsi)
            .expect("subscriber must exist")
    }

    /// Location update `imsi` on `conn_id` and let the MS finish it, which
    /// releases the connection.
    pub fn register_ue(&self, conn_id: u16, imsi: &str) -> Arc<Ue> {
        self.inject_l3(conn_id, location_update(&mobile_identity("IMSI", imsi)));
        self.inject_l3(conn_id, Pdu::l3("MM", "TMSIReallocationComplete"));
        self.transport.take_sent();
        self.ue(imsi)
    }

    /// Attach a registered subscriber to a fresh connection through a CM
    /// service request.
    pub fn open_service(&self, conn_id: u16, ue: &Ue, service: &str) {
        let req = Pdu::l3("MM", "CMServiceRequest")
            .with_ie_text("CMServiceType", service)
            .with_ie(mobile_identity("TMSI", ue.tmsi()));
        self.inject_l3(conn_id, req);
        let sent = self.sent_l3();
        assert_eq!(sent.len(), 1, "expected a single CM service answer");
        assert_eq!(sent[0].2.message_type(), Some("CMServiceAccept"));
    }
}

pub fn lai(plmn: &str, lac: &str) -> Pdu {
    Pdu::new("LAI")
        .with_child(Pdu::with_text("PLMNidentity", plmn))
        .with_child(Pdu::with_text("LAC", lac))
}

pub fn location_update(identity: &Pdu) -> Pdu {
    Pdu::l3("MM", "LocationUpdatingRequest")
        .with_ie(lai("00101", "03E8"))
        .with_ie(identity.clone())
}

/// Identity text of a StartPaging/StopPaging frame.
pub fn paging_text(msg: &Message) -> String {
    String::from_utf8_lossy(&msg.raw[2..]).into_owned()
}
