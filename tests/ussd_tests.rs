mod common;

use bts_signal::pdu::{mobile_identity, Pdu};
use bts_signal::ussd::ss_message;
use bts_signal::{BtsConfig, BtsError, Collaborator, Event, Primitive};
use common::*;

const SS: &str = "SS-activation";

fn component(comp_type: &str, operation: &str, text: &str) -> Pdu {
    Pdu::new("component")
        .with_attr("remoteCID", "1")
        .with_attr("type", comp_type)
        .with_attr("operationCode", operation)
        .with_child(Pdu::with_text("ussd-Text", text))
}

fn facility(h: &Harness, comp: &Pdu) -> String {
    h.collaborator.map_encode(comp).unwrap()
}

fn decoded_component(h: &Harness, pdu: &Pdu) -> Pdu {
    h.collaborator
        .map_decode(pdu.ie_text("Facility").expect("Facility IE"))
        .unwrap()
}

fn mo_register(h: &Harness, conn_id: u16, text: &str) {
    let comp = component("Invoke", "processUnstructuredSS-Request", text);
    let reg = ss_message("Register", "0", false, None, Some(&facility(h, &comp)));
    h.inject_l3(conn_id, reg);
}

/// Registered subscriber with a routed MO session on connection 2.
fn mo_session(h: &Harness) -> String {
    let ue = h.register_ue(1, IMSI);
    h.open_service(2, &ue, SS);
    mo_register(h, 2, "*100#");
    let route = h.collaborator.dispatched_named("call.route");
    assert_eq!(route.len(), 1);
    route[0].get("id").unwrap().to_string()
}

#[test]
fn test_mo_register_routes_session() {
    let h = Harness::running();
    let id = mo_session(&h);
    assert_eq!(id, "btsss/1/2");
    assert!(h.sent_l3().is_empty());

    let route = h.collaborator.dispatched_named("call.route").remove(0);
    assert_eq!(route.get("route_type"), Some("ussd"));
    assert_eq!(route.get("called"), Some("*100#"));
    assert_eq!(route.get("text"), Some("*100#"));
    assert_eq!(route.get("operation_type"), Some("pssr"));
    assert_eq!(route.get("username"), Some(IMSI));
    let execute = h.collaborator.dispatched_named("ussd.execute");
    assert_eq!(execute[0].get("callto"), Some("app/route"));
    assert_eq!(h.engine.ussd().stats().mo_sessions, 1);
}

#[test]
fn test_mo_session_finalized_by_network() {
    let h = Harness::running();
    let id = mo_session(&h);

    let fin = Event::new("ussd.finalize")
        .with("peerid", id.clone())
        .with("text", "Balance 5")
        .with("operation_type", "pssr");
    h.engine.ussd_finalize(&fin).unwrap();

    let sent = h.sent_l3();
    assert_eq!(sent.len(), 1);
    let rlc = &sent[0].2;
    assert_eq!(rlc.message_type(), Some("ReleaseComplete"));
    assert_eq!(rlc.tid(), Some(("0", true)));
    assert!(rlc.ie("Cause").is_none());
    let comp = decoded_component(&h, rlc);
    assert_eq!(comp.attr("type"), Some("ResultLast"));
    assert_eq!(comp.attr("remoteCID"), Some("1"));
    assert_eq!(comp.child_text("ussd-Text"), Some("Balance 5"));

    // the session is gone
    assert!(matches!(h.engine.ussd_finalize(&fin), Err(BtsError::NoChannel(_))));
}

#[test]
fn test_mo_session_dialogue() {
    let h = Harness::running();
    let id = mo_session(&h);

    let upd = Event::new("ussd.update")
        .with("peerid", id.clone())
        .with("text", "1. Balance")
        .with("operation_type", "ussr");
    h.engine.ussd_update(&upd).unwrap();
    let fac = h.sent_l3().remove(0).2;
    assert_eq!(fac.message_type(), Some("Facility"));
    assert_eq!(fac.tid(), Some(("0", true)));
    let comp = decoded_component(&h, &fac);
    assert_eq!(comp.attr("type"), Some("Invoke"));
    assert_eq!(comp.attr("localCID"), Some("0"));
    assert_eq!(comp.attr("operationCode"), Some("unstructuredSS-Request"));

    // MS answers
    let answer = component("ReturnResult", "unstructuredSS-Request", "1");
    h.inject_l3(2, ss_message("Facility", "0", false, None, Some(&facility(&h, &answer))));
    let update = h.collaborator.enqueued_named("ussd.update");
    assert_eq!(update.len(), 1);
    assert_eq!(update[0].get("id"), Some(id.as_str()));
    assert_eq!(update[0].get("peerid"), Some("app/1"));
    assert_eq!(update[0].get("text"), Some("1"));
    assert_eq!(update[0].get("operation_type"), Some("ussr"));

    // MS ends it
    h.inject_l3(2, ss_message("ReleaseComplete", "0", false, None, None));
    let fin = h.collaborator.enqueued_named("ussd.finalize");
    assert_eq!(fin.len(), 1);
    assert_eq!(fin[0].get("peerid"), Some("app/1"));
    assert!(matches!(h.engine.ussd_update(&upd), Err(BtsError::NoChannel(_))));
}

#[test]
fn test_mo_session_answered_by_pssr_update() {
    let h = Harness::running();
    let id = mo_session(&h);
    let upd = Event::new("ussd.update")
        .with("peerid", id)
        .with("text", "x")
        .with("operation_type", "pssr");
    h.engine.ussd_update(&upd).unwrap();
    let fac = h.sent_l3().remove(0).2;
    let comp = decoded_component(&h, &fac);
    assert_eq!(comp.attr("type"), Some("ResultLast"));
    assert_eq!(comp.attr("remoteCID"), Some("1"));
}

#[test]
fn test_pssr_not_allowed_on_mt_session() {
    let h = Harness::running();
    let ue = h.register_ue(1, IMSI);
    h.open_service(2, &ue, SS);
    let id = mt_execute(&h).unwrap();
    let upd = Event::new("ussd.update")
        .with("peerid", id)
        .with("text", "x")
        .with("operation_type", "pssr");
    assert!(matches!(h.engine.ussd_update(&upd), Err(BtsError::Failure(_))));
}

#[test]
fn test_empty_ussd_text_rejected() {
    let h = Harness::running();
    let ue = h.register_ue(1, IMSI);
    h.open_service(2, &ue, SS);
    mo_register(&h, 2, "");
    let rlc = h.sent_l3().remove(0).2;
    assert_eq!(rlc.message_type(), Some("ReleaseComplete"));
    assert_eq!(rlc.tid(), Some(("0", true)));
    assert_eq!(rlc.ie_text("Cause"), Some("facility-rejected"));
    assert_eq!(h.engine.ussd().stats().rejected, 1);
    assert!(h.collaborator.dispatched_named("call.route").is_empty());
}

#[test]
fn test_register_with_wrong_operation_rejected() {
    let h = Harness::running();
    let ue = h.register_ue(1, IMSI);
    h.open_service(2, &ue, SS);
    let comp = component("Invoke", "unstructuredSS-Notify", "x");
    h.inject_l3(2, ss_message("Register", "0", false, None, Some(&facility(&h, &comp))));
    let rlc = h.sent_l3().remove(0).2;
    assert_eq!(rlc.ie_text("Cause"), Some("protocol-error"));
}

#[test]
fn test_register_without_subscriber_rejected() {
    let h = Harness::running();
    h.inject_l3(4, Pdu::l3("MM", "MMStatus"));
    mo_register(&h, 4, "*100#");
    let rlc = h.sent_l3().remove(0).2;
    assert_eq!(rlc.ie_text("Cause"), Some("protocol-error"));
}

#[test]
fn test_facility_for_unknown_session() {
    let h = Harness::running();
    let ue = h.register_ue(1, IMSI);
    h.open_service(2, &ue, SS);
    h.inject_l3(2, ss_message("Facility", "3", false, None, Some("00")));
    let rlc = h.sent_l3().remove(0).2;
    assert_eq!(rlc.message_type(), Some("ReleaseComplete"));
    assert_eq!(rlc.tid(), Some(("3", true)));
    assert_eq!(rlc.ie_text("Cause"), Some("invalid-callref"));
}

#[test]
fn test_mo_session_times_out() {
    let h = Harness::with_config(BtsConfig {
        ussd_timeout_ms: 30_000,
        ..test_config()
    });
    h.bring_up();
    mo_session(&h);

    h.advance(30_000);
    let rlc = h
        .sent_l3()
        .into_iter()
        .find(|(_, _, p)| p.message_type() == Some("ReleaseComplete"))
        .unwrap()
        .2;
    assert_eq!(rlc.ie_text("Cause"), Some("timeout"));
    let fin = h.collaborator.enqueued_named("ussd.finalize");
    assert_eq!(fin[0].get("error"), Some("timeout"));
}

#[test]
fn test_connection_loss_finalizes_session() {
    let h = Harness::running();
    mo_session(&h);
    h.inject_conn(Primitive::ConnLost, 2, 0);
    assert!(h.sent_l3().is_empty());
    let fin = h.collaborator.enqueued_named("ussd.finalize");
    assert_eq!(fin.len(), 1);
    assert_eq!(fin[0].get("error"), Some("net-out-of-order"));
}

fn mt_execute(h: &Harness) -> Result<String, BtsError> {
    let ev = Event::new("ussd.execute")
        .with("text", "Hello")
        .with("operation_type", "ussr")
        .with("id", "net/1")
        .with("timeout", "30000");
    h.engine.ussd_execute(&format!("IMSI{IMSI}"), &ev)
}

#[test]
fn test_mt_session_pages_then_registers() {
    let h = Harness::running();
    let ue = h.register_ue(1, IMSI);
    let id = mt_execute(&h).unwrap();
    assert_eq!(id, "btsss/1");
    assert_eq!(h.engine.ussd().parked_ids(), vec![id.clone()]);
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].primitive, Primitive::StartPaging);
    assert_eq!(sent[0].info, 2);

    h.inject_l3(6, Pdu::l3("RRM", "PagingResponse").with_ie(mobile_identity("TMSI", ue.tmsi())));
    let sent = h.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].primitive, Primitive::StopPaging);
    let register = sent[1].pdu.as_ref().unwrap();
    assert_eq!(register.message_type(), Some("Register"));
    assert_eq!(register.tid(), Some(("0", false)));
    let comp = decoded_component(&h, register);
    assert_eq!(comp.attr("type"), Some("Invoke"));
    assert_eq!(comp.attr("localCID"), Some("0"));
    assert_eq!(comp.child_text("ussd-Text"), Some("Hello"));
    assert!(h.engine.ussd().parked_ids().is_empty());

    let answer = component("ReturnResult", "unstructuredSS-Request", "2");
    h.inject_l3(6, ss_message("Facility", "0", true, None, Some(&facility(&h, &answer))));
    let update = h.collaborator.enqueued_named("ussd.update");
    assert_eq!(update[0].get("peerid"), Some("net/1"));
    assert_eq!(update[0].get("text"), Some("2"));

    h.inject_l3(6, ss_message("ReleaseComplete", "0", true, None, None));
    let fin = h.collaborator.enqueued_named("ussd.finalize");
    assert_eq!(fin.len(), 1);
    assert_eq!(fin[0].get("id"), Some("btsss/1"));
    assert_eq!(fin[0].get("peerid"), Some("net/1"));
}

#[test]
fn test_mt_session_on_existing_connection() {
    let h = Harness::running();
    let ue = h.register_ue(1, IMSI);
    h.open_service(2, &ue, SS);
    mt_execute(&h).unwrap();
    let register = h.sent_l3().remove(0);
    assert_eq!(register.0, 2);
    assert_eq!(register.2.message_type(), Some("Register"));
    // one session per connection
    assert!(matches!(mt_execute(&h), Err(BtsError::Busy)));
}

#[test]
fn test_parked_session_times_out() {
    let h = Harness::running();
    h.register_ue(1, IMSI);
    mt_execute(&h).unwrap();
    h.transport.take_sent();

    h.advance(30_000);
    assert!(h.engine.ussd().parked_ids().is_empty());
    assert!(h.sent().iter().any(|m| m.primitive == Primitive::StopPaging));
    let fin = h.collaborator.enqueued_named("ussd.finalize");
    assert_eq!(fin[0].get("error"), Some("timeout"));
    assert_eq!(fin[0].get("peerid"), Some("net/1"));
    assert_eq!(h.engine.ussd().stats().timeouts, 1);
}

#[test]
fn test_parked_session_cancelled() {
    let h = Harness::running();
    h.register_ue(1, IMSI);
    let id = mt_execute(&h).unwrap();
    h.transport.take_sent();

    let upd = Event::new("ussd.update").with("peerid", id.clone()).with("text", "x");
    assert!(matches!(h.engine.ussd_update(&upd), Err(BtsError::Failure(_))));

    h.engine
        .ussd_finalize(&Event::new("ussd.finalize").with("peerid", id))
        .unwrap();
    assert!(h.engine.ussd().parked_ids().is_empty());
    assert_eq!(h.sent()[0].primitive, Primitive::StopPaging);
    assert!(h.collaborator.enqueued_named("ussd.finalize").is_empty());
}

#[test]
fn test_mt_execute_errors() {
    let h = Harness::running();
    assert!(matches!(
        h.engine.ussd_execute("IMSI1", &Event::new("ussd.execute").with("text", "x")),
        Err(BtsError::Offline(_))
    ));
    h.register_ue(1, IMSI);
    // pssr cannot start a session
    let ev = Event::new("ussd.execute")
        .with("text", "x")
        .with("operation_type", "pssr");
    assert!(matches!(
        h.engine.ussd_execute(&format!("IMSI{IMSI}"), &ev),
        Err(BtsError::Failure(_))
    ));
    assert!(matches!(
        h.engine.ussd_finalize(&Event::new("ussd.finalize").with("peerid", "other/1")),
        Err(BtsError::NoChannel(_))
    ));
}
