mod common;

use common::{Recorder, drain_requests, engine, feed};
use std::sync::Arc;
use tlcp_client::core::types::{SnapshotRequest, SubscriptionHandle, SubscriptionMode};
use tlcp_client::{Engine, SecondLevelConfig, SubscriptionConfig, Transport};

fn portfolio() -> SubscriptionConfig {
    SubscriptionConfig::new(SubscriptionMode::Command)
        .with_items(["portfolio"])
        .with_fields(["key", "command", "qty"])
}

fn subscribed(e: &mut Engine, config: SubscriptionConfig, rec: &Arc<Recorder>) -> SubscriptionHandle {
    let handle = e.subscribe(config, rec.subscription()).unwrap();
    e.on_session_started(Transport::Http);
    let add = e.next_request().unwrap();
    feed(e, &[&format!("REQOK,{}", add.req_id), "SUBCMD,1,1,3,1,2"]);
    handle
}

#[test]
fn keys_are_added_updated_and_deleted() {
    let mut e = engine();
    let rec = Recorder::new();
    let handle = subscribed(&mut e, portfolio().with_snapshot(SnapshotRequest::Yes), &rec);
    assert_eq!(e.key_position(handle).unwrap(), Some(1));
    assert_eq!(e.command_position(handle).unwrap(), Some(2));

    feed(
        &mut e,
        &[
            "U,1,1,k1|ADD|10",
            "EOS,1,1",
            "U,1,1,k2|ADD|20",
            "U,1,1,k1|UPDATE|11",
            "U,1,1,k2|DELETE|#",
        ],
    );
    e.callbacks().drain();
    assert_eq!(
        rec.take(),
        vec![
            "listen_start",
            "subscribed",
            "update 1 [k1|ADD|10] snapshot",
            "eos 1",
            "update 1 [k2|ADD|20]",
            "update 1 [k1|UPDATE|11]",
            "update 1 [k2|DELETE|#]",
        ]
    );
    assert_eq!(e.command_value(handle, 1, "k1", 3).unwrap().as_deref(), Some("11"));
    assert_eq!(e.command_value(handle, 1, "k2", 3).unwrap(), None);
}

#[test]
fn first_sighting_is_reported_as_add() {
    let mut e = engine();
    let rec = Recorder::new();
    subscribed(&mut e, portfolio(), &rec);
    feed(&mut e, &["U,1,1,k1|UPDATE|1", "U,1,1,k1|ADD|2"]);
    e.callbacks().drain();
    assert_eq!(
        rec.take()[2..],
        ["update 1 [k1|ADD|1]", "update 1 [k1|UPDATE|2]"]
    );
}

#[test]
fn clear_snapshot_drops_every_key_silently() {
    let mut e = engine();
    let rec = Recorder::new();
    let handle = subscribed(&mut e, portfolio(), &rec);
    feed(&mut e, &["U,1,1,k1|ADD|1", "U,1,1,k2|ADD|2", "CS,1,1"]);
    e.callbacks().drain();
    assert_eq!(rec.take().last().map(String::as_str), Some("cs 1"));
    assert_eq!(e.command_value(handle, 1, "k1", 3).unwrap(), None);

    feed(&mut e, &["U,1,1,k1|UPDATE|3"]);
    e.callbacks().drain();
    assert_eq!(rec.take(), vec!["update 1 [k1|ADD|3]"]);
}

fn two_level() -> SubscriptionConfig {
    portfolio().with_second_level(SecondLevelConfig::with_fields(["price"]))
}

#[test]
fn second_level_rows_follow_their_key() {
    let mut e = engine();
    let rec = Recorder::new();
    let handle = subscribed(&mut e, two_level(), &rec);
    feed(&mut e, &["CONF,1,2,filtered", "U,1,1,item3|ADD|5"]);

    let nested = e.next_request().unwrap();
    assert_eq!(nested.op(), Some("add"));
    assert_eq!(nested.get("LS_subId"), Some("2"));
    assert_eq!(nested.get("LS_mode"), Some("MERGE"));
    assert_eq!(nested.get("LS_group"), Some("item3"));
    assert_eq!(nested.get("LS_schema"), Some("price"));
    assert_eq!(nested.get("LS_snapshot"), Some("true"));

    feed(
        &mut e,
        &[
            &format!("REQOK,{}", nested.req_id),
            "SUBOK,2,1,1",
            "U,2,1,9.5",
            "CONF,2,unlimited,filtered",
        ],
    );
    assert_eq!(e.command_value(handle, 1, "item3", 4).unwrap().as_deref(), Some("9.5"));

    feed(&mut e, &["U,1,1,item3|DELETE|#"]);
    let delete = e.next_request().unwrap();
    assert_eq!(delete.op(), Some("delete"));
    assert_eq!(delete.get("LS_subId"), Some("2"));

    e.callbacks().drain();
    assert_eq!(
        rec.take(),
        vec![
            "listen_start",
            "subscribed",
            "frequency 2",
            "update 1 [item3|ADD|5]",
            "update 1 [item3|UPDATE|5|9.5]",
            "frequency unlimited",
            "update 1 [item3|DELETE|#|#]",
            "frequency 2",
        ]
    );
    let updates = rec.take_updates();
    assert_eq!(updates[1].value_by_name("price").as_deref(), Some("9.5"));
    assert!(updates[1].is_two_level());
}

#[test]
fn illegal_key_keeps_first_level_only() {
    let mut e = engine();
    let rec = Recorder::new();
    subscribed(&mut e, two_level(), &rec);
    feed(&mut e, &["U,1,1,123|ADD|5"]);
    assert!(drain_requests(&mut e).is_empty());
    e.callbacks().drain();
    assert_eq!(rec.take()[2..], ["second_level_error 14 123", "update 1 [123|ADD|5]"]);
}

#[test]
fn refused_nested_subscription_is_reported_on_the_parent() {
    let mut e = engine();
    let rec = Recorder::new();
    let handle = subscribed(&mut e, two_level(), &rec);
    feed(&mut e, &["U,1,1,item4|ADD|1"]);
    let nested = e.next_request().unwrap();
    feed(&mut e, &[&format!("REQERR,{},17,denied", nested.req_id), "U,1,1,item4|UPDATE|2"]);
    assert!(drain_requests(&mut e).is_empty());

    e.callbacks().drain();
    assert_eq!(
        rec.take()[2..],
        [
            "update 1 [item4|ADD|1]",
            "second_level_error 17 item4",
            "update 1 [item4|UPDATE|2]",
        ]
    );
    assert_eq!(e.command_value(handle, 1, "item4", 3).unwrap().as_deref(), Some("2"));
}

#[test]
fn unsubscribing_the_parent_closes_nested_subscriptions() {
    let mut e = engine();
    let rec = Recorder::new();
    let handle = subscribed(&mut e, two_level(), &rec);
    feed(&mut e, &["U,1,1,item3|ADD|5"]);
    let nested = e.next_request().unwrap();
    feed(&mut e, &[&format!("REQOK,{}", nested.req_id), "SUBOK,2,1,1"]);

    e.unsubscribe(handle).unwrap();
    let ops: Vec<_> = drain_requests(&mut e)
        .iter()
        .map(|r| (r.op().map(str::to_string), r.get("LS_subId").map(str::to_string)))
        .collect();
    assert_eq!(
        ops,
        vec![
            (Some("delete".to_string()), Some("1".to_string())),
            (Some("delete".to_string()), Some("2".to_string())),
        ]
    );
}
