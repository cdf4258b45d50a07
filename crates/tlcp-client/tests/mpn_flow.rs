mod common;

use assert_matches::assert_matches;
use common::{Recorder, drain_requests, engine, feed};
use std::sync::Arc;
use tlcp_client::core::ControlRequest;
use tlcp_client::core::types::{MpnHandle, SubscriptionMode};
use tlcp_client::{
    ClientError, DeviceStatus, Engine, MpnDeviceConfig, MpnSubscriptionConfig, MpnSubscriptionStatus, Transport,
};

fn device() -> MpnDeviceConfig {
    MpnDeviceConfig::new("Apple", "com.example.app", "token-1")
}

fn alert() -> MpnSubscriptionConfig {
    MpnSubscriptionConfig::new(SubscriptionMode::Merge, "item1", "last_price", "fmt")
}

fn single(e: &mut Engine) -> ControlRequest {
    let mut requests = drain_requests(e);
    assert_eq!(requests.len(), 1, "expected one request, got {requests:?}");
    requests.remove(0)
}

/// Registered device, active MPN subscription with its status item subscribed.
fn active(e: &mut Engine, rec: &Arc<Recorder>) -> MpnHandle {
    e.on_session_started(Transport::Http);
    e.register_device(device(), rec.device()).unwrap();
    let handle = e.mpn_subscribe(alert(), rec.mpn()).unwrap();
    let register = single(e);
    assert_eq!(register.op(), Some("register"));
    feed(e, &[&format!("REQOK,{}", register.req_id), "MPNREG,dev1,adapterX"]);

    let activate = single(e);
    assert_eq!(activate.op(), Some("activate"));
    feed(e, &[&format!("REQOK,{}", activate.req_id), "MPNOK,1,mpnA"]);

    let status = single(e);
    assert_eq!(status.get("LS_group"), Some("SUB-mpnA"));
    feed(
        e,
        &[
            &format!("REQOK,{}", status.req_id),
            "SUBOK,2,1,4",
            "U,2,1,ACTIVE|1700000000|fmt|#",
        ],
    );
    handle
}

#[test]
fn mpn_subscriptions_wait_for_the_device() {
    let mut e = engine();
    let rec = Recorder::new();
    assert_matches!(e.mpn_subscribe(alert(), None), Err(ClientError::DeviceNotRegistered));

    e.on_session_started(Transport::Http);
    e.register_device(device(), rec.device()).unwrap();
    let handle = e.mpn_subscribe(alert(), rec.mpn()).unwrap();
    assert_eq!(e.mpn_status(handle).unwrap(), MpnSubscriptionStatus::Inactive);
    assert_eq!(e.device_status(), Some(DeviceStatus::Registering));

    let register = single(&mut e);
    assert_eq!(register.get("PN_type"), Some("Apple"));
    assert_eq!(register.get("PN_appId"), Some("com.example.app"));
    assert_eq!(register.get("PN_deviceToken"), Some("token-1"));

    feed(&mut e, &["MPNREG,dev1,adapterX"]);
    assert_eq!(e.device_status(), Some(DeviceStatus::Registered));
    let activate = single(&mut e);
    assert_eq!(activate.get("LS_subId"), Some("1"));
    assert_eq!(activate.get("LS_mode"), Some("MERGE"));
    assert_eq!(activate.get("LS_group"), Some("item1"));
    assert_eq!(activate.get("LS_schema"), Some("last_price"));
    assert_eq!(activate.get("PN_deviceId"), Some("dev1"));
    assert_eq!(activate.get("PN_notificationFormat"), Some("fmt"));
    assert_eq!(e.mpn_status(handle).unwrap(), MpnSubscriptionStatus::Activating);

    e.callbacks().drain();
    assert_eq!(rec.take(), vec!["mpn_listen_start", "device_registered dev1"]);
}

#[test]
fn activation_opens_the_status_item() {
    let mut e = engine();
    let rec = Recorder::new();
    let handle = active(&mut e, &rec);
    assert_eq!(e.mpn_status(handle).unwrap(), MpnSubscriptionStatus::Subscribed);

    feed(&mut e, &["U,2,1,TRIGGERED|1700000100||"]);
    assert_eq!(e.mpn_status(handle).unwrap(), MpnSubscriptionStatus::Triggered);

    e.callbacks().drain();
    assert_eq!(
        rec.take(),
        vec![
            "mpn_listen_start",
            "device_registered dev1",
            "mpn_subscribed",
            "mpn_status ACTIVE Some(1700000000)",
            "mpn_property status_timestamp",
            "mpn_status TRIGGERED Some(1700000100)",
            "mpn_triggered",
            "mpn_property status_timestamp",
        ]
    );
}

#[test]
fn modifications_are_sent_one_at_a_time_by_priority() {
    let mut e = engine();
    let rec = Recorder::new();
    let handle = active(&mut e, &rec);
    rec.take();

    e.set_trigger(handle, Some("Double.parseDouble(${last_price}) > 10".to_string()))
        .unwrap();
    e.set_notification_format(handle, "fmt2").unwrap();
    e.mpn_unsubscribe(handle).unwrap();

    let trigger = single(&mut e);
    assert_eq!(trigger.op(), Some("pn_reconf"));
    assert_eq!(trigger.get("PN_subscriptionId"), Some("mpnA"));
    assert_eq!(trigger.get("PN_trigger"), Some("Double.parseDouble(${last_price}) > 10"));

    feed(&mut e, &[&format!("REQOK,{}", trigger.req_id)]);
    let deactivate = single(&mut e);
    assert_eq!(deactivate.op(), Some("deactivate"));
    assert_eq!(deactivate.get("PN_deviceId"), Some("dev1"));
    assert_eq!(deactivate.get("PN_subscriptionId"), Some("mpnA"));

    feed(&mut e, &[&format!("REQOK,{}", deactivate.req_id)]);
    assert_eq!(e.mpn_status(handle).unwrap(), MpnSubscriptionStatus::Terminated);
    let status_delete = single(&mut e);
    assert_eq!(status_delete.op(), Some("delete"));
    assert_eq!(status_delete.get("LS_subId"), Some("2"));

    e.callbacks().drain();
    assert_eq!(rec.take(), vec!["mpn_property trigger", "mpn_unsubscribed"]);
}

#[test]
fn session_loss_fails_pending_modifications() {
    let mut e = engine();
    let rec = Recorder::new();
    let handle = active(&mut e, &rec);
    rec.take();

    e.set_notification_format(handle, "fmt2").unwrap();
    e.mpn_unsubscribe(handle).unwrap();
    let format = single(&mut e);
    assert_eq!(format.get("PN_notificationFormat"), Some("fmt2"));

    e.on_session_closed();
    e.callbacks().drain();
    assert_eq!(
        rec.take(),
        vec!["mpn_modification_error 54 notification_format", "mpn_unsub_error 54"]
    );
    assert_eq!(e.mpn_status(handle).unwrap(), MpnSubscriptionStatus::Subscribed);
    assert_eq!(e.device_status(), Some(DeviceStatus::Unregistered));

    e.on_session_started(Transport::Http);
    let register = single(&mut e);
    assert_eq!(register.op(), Some("register"));
    feed(&mut e, &["MPNREG,dev1,adapterX"]);
    let status = single(&mut e);
    assert_eq!(status.op(), Some("add"));
    assert_eq!(status.get("LS_group"), Some("SUB-mpnA"));
    assert_eq!(status.get("LS_data_adapter"), Some("adapterX"));
}

/// Session lost, then a new session whose device registration returns the requests.
fn reconnect(e: &mut Engine) -> Vec<ControlRequest> {
    e.on_session_started(Transport::Http);
    let register = single(e);
    assert_eq!(register.op(), Some("register"));
    feed(e, &["MPNREG,dev1,adapterX"]);
    drain_requests(e)
}

#[test]
fn unsubscribe_made_offline_is_sent_after_registration() {
    let mut e = engine();
    let rec = Recorder::new();
    let handle = active(&mut e, &rec);
    e.on_session_closed();

    e.mpn_unsubscribe(handle).unwrap();
    assert!(drain_requests(&mut e).is_empty());
    assert_eq!(e.mpn_status(handle).unwrap(), MpnSubscriptionStatus::Subscribed);

    let requests = reconnect(&mut e);
    let ops: Vec<_> = requests.iter().map(|r| r.op()).collect();
    assert_eq!(ops, vec![Some("add"), Some("deactivate")]);
    assert_eq!(requests[1].get("PN_subscriptionId"), Some("mpnA"));

    rec.take();
    feed(&mut e, &[&format!("REQOK,{}", requests[1].req_id)]);
    assert_eq!(e.mpn_status(handle).unwrap(), MpnSubscriptionStatus::Terminated);
    e.callbacks().drain();
    assert!(rec.take().iter().any(|event| event == "mpn_unsubscribed"));
}

#[test]
fn trigger_set_offline_is_sent_after_registration() {
    let mut e = engine();
    let rec = Recorder::new();
    let handle = active(&mut e, &rec);
    e.on_session_closed();

    e.set_trigger(handle, Some("true".to_string())).unwrap();
    assert!(drain_requests(&mut e).is_empty());

    let requests = reconnect(&mut e);
    let ops: Vec<_> = requests.iter().map(|r| r.op()).collect();
    assert_eq!(ops, vec![Some("add"), Some("pn_reconf")]);
    assert_eq!(requests[1].get("PN_trigger"), Some("true"));
}

#[test]
fn server_side_deletion_ends_the_subscription() {
    let mut e = engine();
    let rec = Recorder::new();
    let handle = active(&mut e, &rec);
    rec.take();

    feed(&mut e, &["MPNDEL,mpnA"]);
    assert_eq!(e.mpn_status(handle).unwrap(), MpnSubscriptionStatus::Terminated);
    assert_eq!(single(&mut e).op(), Some("delete"));
    e.callbacks().drain();
    assert_eq!(rec.take(), vec!["mpn_unsubscribed"]);
}

#[test]
fn failed_registration_fails_waiting_subscriptions() {
    let mut e = engine();
    let rec = Recorder::new();
    e.on_session_started(Transport::Http);
    e.register_device(device(), rec.device()).unwrap();
    let handle = e.mpn_subscribe(alert(), rec.mpn()).unwrap();
    let register = single(&mut e);

    feed(&mut e, &[&format!("REQERR,{},46,unknown%20app", register.req_id)]);
    assert_eq!(e.device_status(), Some(DeviceStatus::Failed));
    assert_eq!(e.mpn_status(handle).unwrap(), MpnSubscriptionStatus::Terminated);
    e.callbacks().drain();
    assert_eq!(rec.take(), vec!["mpn_listen_start", "device_failed 46", "mpn_sub_error 46"]);
}
