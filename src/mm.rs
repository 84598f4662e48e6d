//! Mobility management: location updating, CM service requests, IMSI
//! detach, identity resolution and paging.

use crate::collaborator::Event;
use crate::config::LaiConfig;
use crate::connection::ConnHandle;
use crate::engine::Engine;
use crate::error::RejectCause;
use crate::message::{Message, Primitive};
use crate::pdu::{mobile_identity, Pdu, PROTO_MM};
use crate::signalling::Signalling;
use crate::ue::{Ue, UeDirectory};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const CM_SERVICE_TYPES: [&str; 3] = [
    "MO-call-establishment-or-PM-connection-establishment",
    "SMS",
    "SS-activation",
];

/// Channel type requested in a paging message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PagingChannel {
    Voice = 0,
    Sms = 1,
    Ss = 2,
}

/// Page `ue`, or join the paging already in progress. Returns false when
/// the request could not be sent.
pub fn start_paging(ue: &Ue, channel: PagingChannel, sig: &Signalling) -> bool {
    {
        let mut st = ue.lock();
        st.page_count += 1;
        if !st.paging.is_empty() {
            return true;
        }
    }
    let sent = ue
        .paging_identity()
        .filter(|ident| sig.send(&Message::paging(Primitive::StartPaging, channel as u8, ident)));
    let mut st = ue.lock();
    match sent {
        Some(ident) => {
            debug!("Started paging {}", ident);
            if st.paging.is_empty() {
                st.paging = ident;
            }
            true
        }
        None => {
            st.page_count = st.page_count.saturating_sub(1);
            false
        }
    }
}

/// Release one paging reference, stopping the paging with the last one.
pub fn stop_paging(ue: &Ue, sig: &Signalling) {
    let stop = {
        let mut st = ue.lock();
        if st.page_count == 0 {
            false
        } else {
            st.page_count -= 1;
            st.page_count == 0
        }
    };
    if stop {
        stop_paging_now(ue, sig);
    }
}

/// Stop paging regardless of outstanding references.
pub fn stop_paging_now(ue: &Ue, sig: &Signalling) {
    let key = ue.paging_key();
    if key.is_empty() {
        return;
    }
    if sig.send(&Message::paging(Primitive::StopPaging, 0, &key)) {
        debug!("Stopped paging {}", key);
        let mut st = ue.lock();
        if st.paging == key {
            st.paging.clear();
        }
    }
}

/// `LAI` IE for the station's own area.
pub fn lai_ie(lai: &LaiConfig) -> Pdu {
    Pdu::new("LAI")
        .with_child(Pdu::with_text("PLMNidentity", &lai.plmn()))
        .with_child(Pdu::with_text("LAC", &lai.lac_hex()))
}

/// `mccmnc_lac` key of a received `LAI` IE.
fn lai_key(ie: &Pdu) -> String {
    format!(
        "{}_{}",
        ie.child_text("PLMNidentity").unwrap_or_default(),
        ie.child_text("LAC").unwrap_or_default().to_ascii_uppercase()
    )
}

/// TMSI or IMSI carried by a mobile identity IE, with a TMSI flag.
fn identity_timsi(ie: &Pdu) -> Option<(String, bool)> {
    let (text, is_tmsi) = match (ie.child_text("TMSI"), ie.child_text("IMSI")) {
        (Some(t), _) => (t, true),
        (None, Some(i)) => (i, false),
        (None, None) => return None,
    };
    (!text.is_empty()).then(|| (text.to_string(), is_tmsi))
}

fn mm_message(msg_type: &str, cause: Option<RejectCause>) -> Pdu {
    let pdu = Pdu::l3(PROTO_MM, msg_type);
    match cause {
        Some(c) => pdu.with_ie_text("RejectCause", &c.code().to_string()),
        None => pdu,
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MmStats {
    pub location_updates: u64,
    pub location_rejects: u64,
    pub cm_service_requests: u64,
    pub detaches: u64,
    pub identity_requests: u64,
    pub paging_responses: u64,
}

pub struct MobilityManager {
    directory: UeDirectory,
    lai: LaiConfig,
    ask_imei: bool,
    tmsi_expire_secs: u64,
    stats: Mutex<MmStats>,
}

impl MobilityManager {
    pub fn new(directory: UeDirectory, lai: LaiConfig, ask_imei: bool, tmsi_expire_secs: u64) -> Self {
        Self {
            directory,
            lai,
            ask_imei,
            tmsi_expire_secs,
            stats: Mutex::new(MmStats::default()),
        }
    }

    pub fn directory(&self) -> &UeDirectory {
        &self.directory
    }

    pub fn lai(&self) -> &LaiConfig {
        &self.lai
    }

    pub fn stats(&self) -> MmStats {
        self.stats.lock().clone()
    }

    pub fn handle_pdu(&self, eng: &Engine, conn: &ConnHandle, info: u8, pdu: Pdu) {
        let Some(msg_type) = pdu.message_type().map(str::to_string) else {
            warn!("Missing 'type' in MM on connection {}", conn.id());
            return;
        };
        match msg_type.as_str() {
            "LocationUpdatingRequest" => self.handle_location_update(eng, conn, pdu),
            "TMSIReallocationComplete" | "CMServiceAbort" => eng.drop_conn(conn.id(), true),
            "IMSIDetachIndication" => self.handle_imsi_detach(eng, conn, &pdu),
            "CMServiceRequest" => self.handle_cm_service(eng, conn, pdu),
            "IdentityResponse" => self.handle_identity_response(eng, conn, info, &pdu),
            "MMStatus" => info!(
                "Received MMStatus cause='{}' on connection {}",
                pdu.ie_text("RejectCause").unwrap_or_default(),
                conn.id()
            ),
            other => {
                info!("Unhandled '{}' in MM on connection {}", other, conn.id());
                eng.sig()
                    .send_l3(conn.id(), mm_message("MMStatus", Some(RejectCause::UnknownMessage)), 0);
            }
        }
    }

    fn send_identity_request(&self, eng: &Engine, conn: &ConnHandle, kind: &str) {
        self.stats.lock().identity_requests += 1;
        let pdu = Pdu::l3(PROTO_MM, "IdentityRequest").with_ie_text("IdentityType", kind);
        eng.sig().send_l3(conn.id(), pdu, 0);
    }

    fn handle_location_update(&self, eng: &Engine, conn: &ConnHandle, pdu: Pdu) {
        self.stats.lock().location_updates += 1;
        if let Err(cause) = self.location_update(eng, conn, pdu) {
            info!("Rejecting LocationUpdatingRequest conn={}: cause {}", conn.id(), cause);
            self.stats.lock().location_rejects += 1;
            eng.sig()
                .send_l3(conn.id(), mm_message("LocationUpdatingReject", Some(cause)), 0);
            eng.drop_conn(conn.id(), true);
        }
    }

    fn location_update(&self, eng: &Engine, conn: &ConnHandle, pdu: Pdu) -> Result<(), RejectCause> {
        let ue = match conn.ue() {
            Some(ue) => ue,
            None => {
                let (Some(lai), Some(identity)) = (pdu.ie("LAI"), pdu.ie("MobileIdentity")) else {
                    info!("LocationUpdatingRequest conn={}: missing LAI or mobile identity", conn.id());
                    return Err(RejectCause::InvalidIE);
                };
                let (ident, is_tmsi) = identity_timsi(identity).ok_or(RejectCause::InvalidIE)?;
                let same_lai = lai_key(lai) == self.lai.key();
                debug!(
                    "Handling LocationUpdatingRequest conn={}: ident={}/{} LAI={}",
                    conn.id(),
                    if is_tmsi { "TMSI" } else { "IMSI" },
                    ident,
                    lai_key(lai)
                );
                // a TMSI from another area means nothing here
                let found = match (is_tmsi, same_lai) {
                    (true, true) => self.directory.find_by_tmsi(&ident),
                    (true, false) => None,
                    (false, _) => self.directory.get_or_create(&ident),
                };
                let Some(ue) = found else {
                    if !conn.stash(pdu) {
                        info!("LocationUpdatingRequest conn={}: cannot postpone request", conn.id());
                        return Err(RejectCause::ServiceNotSupported);
                    }
                    self.send_identity_request(eng, conn, "IMSI");
                    return Ok(());
                };
                if !conn.set_ue(&ue) {
                    error!("LocationUpdatingRequest: UE mismatch on connection {}", conn.id());
                    return Err(RejectCause::ProtocolError);
                }
                ue
            }
        };
        let ask_imei = {
            let mut st = ue.lock();
            let ask = self.ask_imei && st.imei.is_empty() && !st.imei_requested;
            if ask {
                st.imei_requested = true;
            }
            ask
        };
        if ask_imei && conn.stash(pdu) {
            self.send_identity_request(eng, conn, "IMEI");
            return Ok(());
        }
        ue.lock().imsi_detached = false;
        let started = self.start_location_update(eng, &ue, conn.id());
        self.directory
            .update_expire(&ue, eng.clock().now_secs(), self.tmsi_expire_secs);
        if started {
            Ok(())
        } else {
            info!("Location updating for IMSI={}: failed to start worker", ue.imsi());
            Err(RejectCause::ProtocolError)
        }
    }

    fn start_location_update(&self, eng: &Engine, ue: &Ue, conn_id: u16) -> bool {
        let mut ev = Event::new("user.register").with("username", ue.imsi());
        {
            let st = ue.lock();
            if !st.msisdn.is_empty() {
                ev.set("msisdn", st.msisdn.clone());
            }
            if !st.imei.is_empty() {
                ev.set("imei", st.imei.clone());
            }
        }
        ev.set("tmsi", ue.tmsi());
        let imsi = ue.imsi().to_string();
        eng.spawn_worker("location-update", move |eng| {
            debug!("Started location updating for IMSI={}", imsi);
            let ok = eng.collaborator().dispatch(&mut ev);
            move |eng: &Engine, current: bool| {
                eng.mm().loc_upd_terminated(eng, current, &imsi, conn_id, ok, &ev);
            }
        })
    }

    /// Apply a registration result. `current` is false when the session was
    /// restarted meanwhile and the result is dropped.
    pub fn loc_upd_terminated(
        &self,
        eng: &Engine,
        current: bool,
        imsi: &str,
        conn_id: u16,
        ok: bool,
        params: &Event,
    ) {
        if !current {
            info!("Dropping location updating result for IMSI={}: restarted meanwhile", imsi);
            return;
        }
        let Some(ue) = self.directory.find_by_imsi(imsi) else {
            if ok {
                eng.collaborator().enqueue(unregister_event(imsi, None));
            }
            return;
        };
        {
            let mut st = ue.lock();
            // detached meanwhile: revert a successful registration
            if st.imsi_detached {
                drop(st);
                if ok {
                    eng.collaborator().enqueue(unregister_event(imsi, Some(&ue)));
                }
                return;
            }
            if st.registered != ok {
                info!("IMSI={} register {}", imsi, if ok { "succeeded" } else { "failed" });
            }
            st.registered = ok;
            st.msisdn = params
                .get_or("msisdn", "")
                .trim_start_matches('+')
                .to_string();
        }
        self.directory
            .update_expire(&ue, eng.clock().now_secs(), self.tmsi_expire_secs);
        self.directory.mark_dirty();
        let Some(conn) = eng.sig().registry().find(conn_id) else {
            info!("Can't answer location updating for IMSI={}: connection {} vanished", imsi, conn_id);
            return;
        };
        if ok {
            let pdu = Pdu::l3(PROTO_MM, "LocationUpdatingAccept")
                .with_ie(lai_ie(&self.lai))
                .with_ie(mobile_identity("TMSI", ue.tmsi()));
            eng.sig().send_l3(conn.id(), pdu, 0);
        } else {
            let cause = params
                .value("error")
                .or_else(|| params.value("reason"))
                .and_then(|c| c.trim().parse::<u8>().ok())
                .map_or(RejectCause::ProtocolError, RejectCause::from_code);
            self.stats.lock().location_rejects += 1;
            eng.sig()
                .send_l3(conn.id(), mm_message("LocationUpdatingReject", Some(cause)), 0);
            eng.drop_conn(conn.id(), true);
        }
    }

    fn handle_imsi_detach(&self, eng: &Engine, conn: &ConnHandle, pdu: &Pdu) {
        self.stats.lock().detaches += 1;
        eng.drop_conn(conn.id(), true);
        let Some((ident, is_tmsi)) = pdu.ie("MobileIdentity").and_then(identity_timsi) else {
            return;
        };
        let found = if is_tmsi {
            self.directory.find_by_tmsi(&ident)
        } else {
            self.directory.find_by_imsi(&ident)
        };
        let Some(ue) = found else {
            return;
        };
        stop_paging_now(&ue, eng.sig());
        {
            let mut st = ue.lock();
            if !st.imsi_detached {
                info!("Detached IMSI={}", ue.imsi());
                st.imsi_detached = true;
            }
            if !st.registered {
                return;
            }
            st.registered = false;
        }
        self.directory
            .update_expire(&ue, eng.clock().now_secs(), self.tmsi_expire_secs);
        self.directory.mark_dirty();
        eng.collaborator().enqueue(unregister_event(ue.imsi(), Some(&ue)));
    }

    fn handle_cm_service(&self, eng: &Engine, conn: &ConnHandle, pdu: Pdu) {
        self.stats.lock().cm_service_requests += 1;
        let ue = match conn.ue() {
            Some(ue) => ue,
            None => match self.cm_service_identify(eng, conn, pdu) {
                Ok(Some(ue)) => ue,
                Ok(None) => return,
                Err((cause, drop_conn)) => {
                    self.send_cm_service_rsp(eng, conn, Some(cause));
                    if drop_conn {
                        eng.drop_conn(conn.id(), true);
                    }
                    return;
                }
            },
        };
        stop_paging_now(&ue, eng.sig());
        self.send_cm_service_rsp(eng, conn, None);
        eng.check_mt_service(&ue, conn, false);
    }

    /// Resolve the UE of a CM service request. `Ok(None)` means an identity
    /// request or a reject already went out.
    fn cm_service_identify(
        &self,
        eng: &Engine,
        conn: &ConnHandle,
        pdu: Pdu,
    ) -> Result<Option<Arc<Ue>>, (RejectCause, bool)> {
        let (Some(serv_type), Some(identity)) = (pdu.ie_text("CMServiceType"), pdu.ie("MobileIdentity")) else {
            info!("CMServiceRequest conn={}: missing service type or mobile identity", conn.id());
            return Err((RejectCause::InvalidIE, false));
        };
        if !CM_SERVICE_TYPES.contains(&serv_type) {
            info!(
                "CMServiceRequest conn={}: service type '{}' not supported/subscribed",
                conn.id(),
                serv_type
            );
            return Err((RejectCause::ServiceNotSupported, false));
        }
        let (ident, is_tmsi) = identity_timsi(identity).ok_or((RejectCause::InvalidIE, false))?;
        debug!(
            "Handling CMServiceRequest conn={}: ident={}/{} type={}",
            conn.id(),
            if is_tmsi { "TMSI" } else { "IMSI" },
            ident,
            serv_type
        );
        let found = if is_tmsi {
            self.directory.find_by_tmsi(&ident)
        } else {
            self.directory.get_or_create(&ident)
        };
        let Some(ue) = found else {
            if !conn.stash(pdu) {
                info!("CMServiceRequest conn={}: cannot postpone request", conn.id());
                self.send_cm_service_rsp(eng, conn, Some(RejectCause::ServiceNotSupported));
                return Ok(None);
            }
            self.send_identity_request(eng, conn, "IMSI");
            return Ok(None);
        };
        if !conn.set_ue(&ue) {
            error!("CMServiceRequest: UE mismatch on connection {}", conn.id());
            return Err((RejectCause::ProtocolError, true));
        }
        Ok(Some(ue))
    }

    fn send_cm_service_rsp(&self, eng: &Engine, conn: &ConnHandle, cause: Option<RejectCause>) {
        let msg_type = if cause.is_some() { "CMServiceReject" } else { "CMServiceAccept" };
        eng.sig().send_l3(conn.id(), mm_message(msg_type, cause), 0);
    }

    fn handle_identity_response(&self, eng: &Engine, conn: &ConnHandle, info: u8, pdu: &Pdu) {
        let Some(id) = pdu.ie("MobileIdentity").and_then(Pdu::first_child) else {
            return;
        };
        let (tag, ident) = (id.tag.as_str(), id.text.as_str());
        let ue = match (conn.ue(), tag) {
            (Some(ue), "IMSI") if ue.imsi() != ident => {
                warn!("Got IMSI change {} -> {} on conn={}", ue.imsi(), ident, conn.id());
                eng.drop_conn(conn.id(), true);
                return;
            }
            (Some(ue), _) => ue,
            (None, "IMSI") => match self.directory.get_or_create(ident) {
                Some(ue) if conn.set_ue(&ue) => ue,
                _ => {
                    error!("Failed to set UE in conn={}", conn.id());
                    eng.drop_conn(conn.id(), true);
                    return;
                }
            },
            (None, _) => {
                warn!("Got identity {}={} but have no UE attached on conn={}", tag, ident, conn.id());
                eng.drop_conn(conn.id(), true);
                return;
            }
        };
        if tag == "IMEI" {
            ue.lock().imei = ident.to_string();
            self.directory.mark_dirty();
        }
        if let Some(pending) = conn.take_pending() {
            self.handle_pdu(eng, conn, info, pending);
        }
    }

    /// Match a paging response against the UEs being paged. Returns false
    /// when it was rejected.
    pub fn handle_paging_response(&self, eng: &Engine, conn: &ConnHandle, pdu: &Pdu) -> bool {
        self.stats.lock().paging_responses += 1;
        let identity = pdu
            .ie("MobileIdentity")
            .and_then(Pdu::first_child)
            .filter(|id| !id.text.is_empty());
        let Some(identity) = identity else {
            info!("PagingResponse with no identity on conn={}", conn.id());
            eng.sig()
                .send_rr_status(conn.id(), RejectCause::InvalidIE.code());
            return false;
        };
        let key = format!("{}{}", identity.tag, identity.text);
        let Some(ue) = self.directory.find_paging(&key) else {
            info!("PagingResponse {} conn={} for unknown UE", key, conn.id());
            eng.sig()
                .send_rr_status(conn.id(), RejectCause::UnexpectedMessage.code());
            return false;
        };
        debug!("PagingResponse with {} conn={}", key, conn.id());
        stop_paging_now(&ue, eng.sig());
        if conn.set_ue(&ue) {
            eng.check_mt_service(&ue, conn, true);
        } else {
            error!("PagingResponse: UE mismatch on connection {}", conn.id());
        }
        true
    }

    /// Evict expired subscribers and persist the directory when changed.
    pub fn check_timers(&self, now_secs: u64) {
        self.directory.evict_expired(now_secs);
        self.directory.save_if_dirty();
    }
}

fn unregister_event(imsi: &str, ue: Option<&Ue>) -> Event {
    let mut ev = Event::new("user.unregister").with("username", imsi);
    if let Some(ue) = ue {
        let st = ue.lock();
        if !st.msisdn.is_empty() {
            ev.set("msisdn", st.msisdn.clone());
        }
        if !st.imei.is_empty() {
            ev.set("imei", st.imei.clone());
        }
        drop(st);
        ev.set("tmsi", ue.tmsi());
    }
    ev
}
