use objsync_shared::{
    ClientFilter, ClientSelector, Message, MessageKind, TrackOptions, Value,
};
use objsync_test::{alpha, beta, connect, count_kind, deleted_ids, engine, init_logging, sync, GUEST};

fn create_properties(messages: &[Message]) -> serde_json::Map<String, serde_json::Value> {
    messages
        .iter()
        .find_map(|message| match message {
            Message::Create { type_id, data, .. } if type_id == "Alpha" => {
                data.get("properties").and_then(|properties| properties.as_object()).cloned()
            }
            _ => None,
        })
        .expect("an Alpha create")
}

#[test]
fn hidden_properties_never_reach_the_peer() {
    init_logging();
    let mut host = engine();
    let mut guest = engine();
    let mut bob = engine();
    let to_guest = connect(&mut host, "host", &mut guest, GUEST);
    let to_bob = connect(&mut host, "host", &mut bob, "bob");

    let root = alpha("root");
    let root_id = host.track(&root, TrackOptions::default()).unwrap().object_id().clone();

    let for_guest = sync(&mut host, &mut guest, &to_guest);
    let for_bob = sync(&mut host, &mut bob, &to_bob);

    assert!(!create_properties(&for_guest).contains_key("secret"));
    assert!(create_properties(&for_bob).contains_key("secret"));
    assert_eq!(guest.instance_by_id(&root_id).unwrap().get("secret"), Value::Null);
    assert_eq!(
        bob.instance_by_id(&root_id).unwrap().get("secret"),
        Value::from("hunter2")
    );

    root.set("secret", "swordfish");
    let for_guest = host.get_messages(&to_guest.at_host).unwrap();
    let for_bob = host.get_messages(&to_bob.at_host).unwrap();
    host.clear_states().unwrap();
    assert!(for_guest.is_empty());
    assert_eq!(count_kind(&for_bob, MessageKind::Change), 1);
}

#[test]
fn filtered_roots_are_not_sent() {
    init_logging();
    let mut host = engine();
    let mut guest = engine();
    let mut bob = engine();
    let to_guest = connect(&mut host, "host", &mut guest, GUEST);
    let to_bob = connect(&mut host, "host", &mut bob, "bob");

    let root = alpha("root");
    root.set("beta", &beta("child"));
    let filter = ClientFilter::exclude(vec![ClientSelector::Identity(GUEST.to_string())]);
    host.track(&root, TrackOptions::with_filter(filter)).unwrap();

    assert!(sync(&mut host, &mut guest, &to_guest).is_empty());
    assert_eq!(sync(&mut host, &mut bob, &to_bob).len(), 2);
    assert_eq!(guest.tracked_count(), 0);
    assert_eq!(host.known_clients(&root), vec![to_bob.at_host.clone()]);
}

#[test]
fn filtering_out_a_known_peer_deletes_its_copy() {
    init_logging();
    let mut host = engine();
    let mut guest = engine();
    let to_guest = connect(&mut host, "host", &mut guest, GUEST);

    let root = alpha("root");
    let child = beta("child");
    root.set("beta", &child);
    let root_id = host.track(&root, TrackOptions::default()).unwrap().object_id().clone();
    sync(&mut host, &mut guest, &to_guest);
    assert_eq!(guest.tracked_count(), 2);

    let filter = ClientFilter::include(vec![ClientSelector::Identity("bob".to_string())]);
    host.set_client_filter(&root, Some(filter)).unwrap();
    let batch = sync(&mut host, &mut guest, &to_guest);

    assert!(deleted_ids(&batch).contains(&root_id));
    assert_eq!(count_kind(&batch, MessageKind::Delete), 2);
    assert_eq!(guest.tracked_count(), 0);

    // the root stays tracked on the host and comes back when allowed again
    assert!(host.is_root(&root));
    host.set_client_filter(&root, None).unwrap();
    let batch = sync(&mut host, &mut guest, &to_guest);
    assert_eq!(count_kind(&batch, MessageKind::Create), 2);
    assert_eq!(guest.tracked_count(), 2);
}

#[test]
fn token_selectors_match_one_connection() {
    init_logging();
    let mut host = engine();
    let mut first = engine();
    let mut second = engine();
    let to_first = connect(&mut host, "host", &mut first, "twin");
    let to_second = connect(&mut host, "host", &mut second, "twin");

    let root = alpha("root");
    let filter = ClientFilter::include(vec![ClientSelector::Token(to_second.at_host.clone())]);
    host.track(&root, TrackOptions::with_filter(filter)).unwrap();

    assert!(sync(&mut host, &mut first, &to_first).is_empty());
    assert_eq!(sync(&mut host, &mut second, &to_second).len(), 1);
}
