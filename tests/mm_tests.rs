mod common;

use bts_signal::pdu::{mobile_identity, Pdu};
use bts_signal::{BtsConfig, Message, Primitive};
use common::*;

#[test]
fn test_location_update_by_imsi() {
    let h = Harness::running();
    h.inject_l3(1, location_update(&mobile_identity("IMSI", IMSI)));

    let register = h.collaborator.dispatched_named("user.register");
    assert_eq!(register.len(), 1);
    assert_eq!(register[0].get("username"), Some(IMSI));
    assert_eq!(register[0].get("tmsi"), Some("00000001"));

    let sent = h.sent_l3();
    assert_eq!(sent.len(), 1);
    let (conn_id, _, accept) = &sent[0];
    assert_eq!(*conn_id, 1);
    assert_eq!(accept.message_type(), Some("LocationUpdatingAccept"));
    assert_eq!(
        accept.ie("MobileIdentity").and_then(|m| m.child_text("TMSI")),
        Some("00000001")
    );
    assert_eq!(accept.ie("LAI").and_then(|l| l.child_text("LAC")), Some("03E8"));

    let ue = h.ue(IMSI);
    assert!(ue.is_registered());

    // the MS confirms and the connection goes away
    h.inject_l3(1, Pdu::l3("MM", "TMSIReallocationComplete"));
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].primitive, Primitive::ConnRelease);
    assert_eq!(sent[0].conn_id, Some(1));
    assert_eq!(h.engine.sig().registry().len(), 0);
}

#[test]
fn test_location_update_asks_imei_once() {
    let h = Harness::with_config(BtsConfig::default());
    h.bring_up();
    h.inject_l3(1, location_update(&mobile_identity("IMSI", IMSI)));

    let sent = h.sent_l3();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].2.message_type(), Some("IdentityRequest"));
    assert_eq!(sent[0].2.ie_text("IdentityType"), Some("IMEI"));
    assert!(h.collaborator.dispatched_named("user.register").is_empty());

    let rsp = Pdu::l3("MM", "IdentityResponse").with_ie(mobile_identity("IMEI", "350000000000011"));
    h.inject_l3(1, rsp);
    let sent = h.sent_l3();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].2.message_type(), Some("LocationUpdatingAccept"));
    let register = h.collaborator.dispatched_named("user.register");
    assert_eq!(register[0].get("imei"), Some("350000000000011"));
    assert_eq!(h.ue(IMSI).imei(), "350000000000011");

    // the next update does not ask again
    h.inject_l3(1, Pdu::l3("MM", "TMSIReallocationComplete"));
    h.transport.take_sent();
    let ue = h.ue(IMSI);
    h.inject_l3(2, location_update(&mobile_identity("TMSI", ue.tmsi())));
    let sent = h.sent_l3();
    assert_eq!(sent[0].2.message_type(), Some("LocationUpdatingAccept"));
}

#[test]
fn test_unknown_tmsi_asks_imsi() {
    let h = Harness::running();
    h.inject_l3(4, location_update(&mobile_identity("TMSI", "0000abcd")));
    let sent = h.sent_l3();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].2.message_type(), Some("IdentityRequest"));
    assert_eq!(sent[0].2.ie_text("IdentityType"), Some("IMSI"));

    h.inject_l3(4, Pdu::l3("MM", "IdentityResponse").with_ie(mobile_identity("IMSI", IMSI)));
    let sent = h.sent_l3();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].2.message_type(), Some("LocationUpdatingAccept"));
    assert!(h.ue(IMSI).is_registered());
}

#[test]
fn test_tmsi_from_other_area_is_not_trusted() {
    let h = Harness::running();
    let ue = h.register_ue(1, IMSI);
    let req = Pdu::l3("MM", "LocationUpdatingRequest")
        .with_ie(lai("00102", "0001"))
        .with_ie(mobile_identity("TMSI", ue.tmsi()));
    h.inject_l3(2, req);
    let sent = h.sent_l3();
    assert_eq!(sent[0].2.message_type(), Some("IdentityRequest"));
}

#[test]
fn test_location_update_missing_identity_rejected() {
    let h = Harness::running();
    h.inject_l3(3, Pdu::l3("MM", "LocationUpdatingRequest").with_ie(lai("00101", "03E8")));
    let sent = h.sent();
    assert_eq!(sent.len(), 2);
    let reject = sent[0].pdu.as_ref().unwrap();
    assert_eq!(reject.message_type(), Some("LocationUpdatingReject"));
    assert_eq!(reject.ie_text("RejectCause"), Some("96"));
    assert_eq!(sent[1].primitive, Primitive::ConnRelease);
    assert_eq!(h.engine.mm().stats().location_rejects, 1);
}

#[test]
fn test_registration_failure_uses_collaborator_cause() {
    let h = Harness::running();
    *h.collaborator.register_ok.lock() = false;
    h.collaborator
        .register_params
        .lock()
        .push(("error".to_string(), "13".to_string()));
    h.inject_l3(1, location_update(&mobile_identity("IMSI", IMSI)));
    let sent = h.sent();
    let reject = sent[0].pdu.as_ref().unwrap();
    assert_eq!(reject.message_type(), Some("LocationUpdatingReject"));
    assert_eq!(reject.ie_text("RejectCause"), Some("13"));
    assert_eq!(sent[1].primitive, Primitive::ConnRelease);
    assert!(!h.ue(IMSI).is_registered());
}

#[test]
fn test_registration_non_numeric_cause_maps_to_protocol_error() {
    let h = Harness::running();
    *h.collaborator.register_ok.lock() = false;
    h.collaborator
        .register_params
        .lock()
        .push(("error".to_string(), "forbidden".to_string()));
    h.inject_l3(1, location_update(&mobile_identity("IMSI", IMSI)));
    let reject = h.sent_l3().remove(0).2;
    assert_eq!(reject.ie_text("RejectCause"), Some("111"));
}

#[test]
fn test_imsi_detach_unregisters() {
    let h = Harness::running();
    let ue = h.register_ue(1, IMSI);
    let detach = Pdu::l3("MM", "IMSIDetachIndication").with_ie(mobile_identity("TMSI", ue.tmsi()));
    h.inject_l3(5, detach);

    assert!(ue.is_detached());
    assert!(!ue.is_registered());
    let unreg = h.collaborator.enqueued_named("user.unregister");
    assert_eq!(unreg.len(), 1);
    assert_eq!(unreg[0].get("username"), Some(IMSI));
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].primitive, Primitive::ConnRelease);
}

#[test]
fn test_cm_service_unsupported_type_rejected() {
    let h = Harness::running();
    let ue = h.register_ue(1, IMSI);
    let req = Pdu::l3("MM", "CMServiceRequest")
        .with_ie_text("CMServiceType", "voice-group-call-establishment")
        .with_ie(mobile_identity("TMSI", ue.tmsi()));
    h.inject_l3(2, req);
    let sent = h.sent_l3();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].2.message_type(), Some("CMServiceReject"));
    assert_eq!(sent[0].2.ie_text("RejectCause"), Some("32"));
}

#[test]
fn test_second_unresolved_cm_service_rejected_not_queued() {
    let h = Harness::running();
    let req = || {
        Pdu::l3("MM", "CMServiceRequest")
            .with_ie_text("CMServiceType", "SMS")
            .with_ie(mobile_identity("TMSI", "0000abcd"))
    };
    h.inject_l3(3, req());
    let sent = h.sent_l3();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].2.message_type(), Some("IdentityRequest"));

    h.inject_l3(3, req());
    let sent = h.sent_l3();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].2.message_type(), Some("CMServiceReject"));
    assert_eq!(sent[0].2.ie_text("RejectCause"), Some("32"));
}

#[test]
fn test_unknown_mm_message_gets_status() {
    let h = Harness::running();
    h.inject_l3(1, Pdu::l3("MM", "AuthenticationResponse"));
    let sent = h.sent_l3();
    assert_eq!(sent[0].2.message_type(), Some("MMStatus"));
    assert_eq!(sent[0].2.ie_text("RejectCause"), Some("97"));
}

#[test]
fn test_idle_connection_released() {
    let h = Harness::running();
    h.inject_l3(9, Pdu::l3("MM", "MMStatus"));
    assert_eq!(h.engine.sig().registry().len(), 1);
    h.advance(1_999);
    assert_eq!(h.engine.sig().registry().len(), 1);
    h.advance(1);
    assert_eq!(h.engine.sig().registry().len(), 0);
    let sent = h.sent();
    assert!(sent
        .iter()
        .any(|m| m.primitive == Primitive::ConnRelease && m.conn_id == Some(9)));
}

#[test]
fn test_paging_response_for_unknown_ue() {
    let h = Harness::running();
    let rsp = Pdu::l3("RRM", "PagingResponse").with_ie(mobile_identity("TMSI", "00000077"));
    h.inject_l3(6, rsp);
    let sent = h.sent();
    assert_eq!(sent.len(), 2);
    let status = sent[0].pdu.as_ref().unwrap();
    assert_eq!(status.message_type(), Some("RRStatus"));
    assert_eq!(status.ie_text("RRCause"), Some("98"));
    assert_eq!(sent[1].primitive, Primitive::ConnRelease);
}

#[test]
fn test_registration_answered_from_worker_thread() {
    let h = Harness::with_runtime();
    h.bring_up();
    let (release, gate) = std::sync::mpsc::channel();
    *h.collaborator.register_gate.lock() = Some(gate);

    h.inject_l3(1, location_update(&mobile_identity("IMSI", IMSI)));
    assert!(h.sent_l3().is_empty());

    release.send(()).unwrap();
    h.drain_workers();
    let sent = h.sent_l3();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].2.message_type(), Some("LocationUpdatingAccept"));
    assert!(h.ue(IMSI).is_registered());
}

#[test]
fn test_registration_from_previous_session_discarded() {
    let h = Harness::with_runtime();
    h.bring_up();
    let (release, gate) = std::sync::mpsc::channel();
    *h.collaborator.register_gate.lock() = Some(gate);
    h.inject_l3(1, location_update(&mobile_identity("IMSI", IMSI)));

    h.engine.restart(Some(0));
    h.engine.tick();
    h.inject(&Message::signal(Primitive::Handshake, 0));
    h.inject_raw(&[Primitive::RadioReady.code(), 0]);
    // the same connection id comes back in the new session
    h.inject_l3(1, Pdu::l3("MM", "MMStatus"));
    assert!(h.engine.sig().registry().find(1).is_some());
    h.transport.take_sent();

    release.send(()).unwrap();
    h.drain_workers();
    assert!(h
        .sent_l3()
        .iter()
        .all(|(_, _, pdu)| pdu.message_type() != Some("LocationUpdatingAccept")));
    assert!(!h.ue(IMSI).is_registered());
}
