use objsync_shared::{
    Instance, MapAgent, Message, ObjectId, ObjectSyncError, PeerSettings, TrackOptions, Value,
};
use objsync_test::{alpha, beta, connect, engine, init_logging, sync};
use serde_json::json;

#[test]
fn disallowed_reference_types_reject_the_batch() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    let root_id = host.track(&root, TrackOptions::default()).unwrap().object_id().clone();
    sync(&mut host, &mut peer, &link);

    let copy = peer.instance_by_id(&root_id).unwrap();
    copy.set("name", "renamed");
    copy.set("beta", &alpha("intruder"));
    let reply = peer.get_messages(&link.at_peer).unwrap();
    assert_eq!(reply.len(), 2);

    let result = host.apply_messages(&link.at_host, reply);
    assert!(matches!(
        result,
        Err(ObjectSyncError::DisallowedType { type_name, .. }) if type_name == "Alpha"
    ));
    assert_eq!(root.get("name"), Value::from("root"));
    assert!(root.get("beta").is_null());
    assert_eq!(host.tracked_count(), 1);
}

#[test]
fn allowed_reference_types_are_applied() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    let root_id = host.track(&root, TrackOptions::default()).unwrap().object_id().clone();
    sync(&mut host, &mut peer, &link);

    peer.instance_by_id(&root_id).unwrap().set("beta", &beta("gift"));
    let reply = peer.get_messages(&link.at_peer).unwrap();
    host.apply_messages(&link.at_host, reply).unwrap();

    let Value::Object(gift) = root.get("beta") else {
        panic!("reference did not resolve");
    };
    assert_eq!(gift.get("label"), Value::from("gift"));
    assert_eq!(host.tracked_count(), 2);
}

#[test]
fn unknown_references_leave_everything_untouched() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    let root_id = host.track(&root, TrackOptions::default()).unwrap().object_id().clone();
    sync(&mut host, &mut peer, &link);

    let batch = vec![
        Message::Change {
            object_id: root_id.clone(),
            data: json!({ "properties": { "name": { "value": "first" } } }),
        },
        Message::Change {
            object_id: root_id,
            data: json!({ "properties": { "beta": { "objectId": "ghost", "typeId": "Beta" } } }),
        },
    ];
    let result = host.apply_messages(&link.at_host, batch);
    assert!(matches!(
        result,
        Err(ObjectSyncError::UnknownObject { object_id }) if object_id == ObjectId::from("ghost")
    ));
    assert_eq!(root.get("name"), Value::from("root"));
}

#[test]
fn changes_to_unknown_objects_are_rejected() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let batch = vec![Message::Change {
        object_id: ObjectId::from("nowhere"),
        data: json!({ "properties": {} }),
    }];
    assert!(matches!(
        host.apply_messages(&link.at_host, batch),
        Err(ObjectSyncError::UnknownObject { .. })
    ));
}

#[test]
fn unknown_types_are_rejected() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let batch = vec![Message::Create {
        object_id: ObjectId::from("p-1"),
        type_id: "Unregistered".to_string(),
        data: json!({ "properties": {} }),
        is_root: true,
    }];
    assert!(matches!(
        host.apply_messages(&link.at_host, batch),
        Err(ObjectSyncError::UnknownType { .. })
    ));
    assert_eq!(host.tracked_count(), 0);
}

#[test]
fn strangers_cannot_send_batches() {
    init_logging();
    let mut host = engine();
    let mut other = engine();
    let stranger = other.register_peer(PeerSettings::new("stranger"));

    assert!(matches!(
        host.apply_messages(&stranger, Vec::new()),
        Err(ObjectSyncError::UnknownPeer { identity }) if identity == "stranger"
    ));
    assert!(matches!(
        host.get_messages(&stranger),
        Err(ObjectSyncError::UnknownPeer { .. })
    ));
}

#[test]
fn peers_cannot_delete_owned_objects() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    let root_id = host.track(&root, TrackOptions::default()).unwrap().object_id().clone();
    sync(&mut host, &mut peer, &link);

    host.apply_messages(&link.at_host, vec![Message::Delete { object_id: root_id.clone() }])
        .unwrap();
    assert_eq!(host.instance_by_id(&root_id), Some(root));

    host.apply_messages(
        &link.at_host,
        vec![Message::Delete {
            object_id: ObjectId::from("never-seen"),
        }],
    )
    .unwrap();
}

#[test]
fn duplicate_creates_are_rejected() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    host.track(&root, TrackOptions::default()).unwrap();
    let batch = host.get_messages(&link.at_host).unwrap();
    peer.apply_messages(&link.at_peer, batch.clone()).unwrap();

    assert!(matches!(
        peer.apply_messages(&link.at_peer, batch),
        Err(ObjectSyncError::ObjectAlreadyExists { .. })
    ));
    assert_eq!(peer.tracked_count(), 1);
}

#[test]
fn map_keys_and_values_are_checked_against_their_own_lists() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let map = Instance::new_observable_map(Vec::new());
    let map_id = host.track(&map, TrackOptions::default()).unwrap().object_id().clone();
    host.configure_agent(&map, |agent| {
        let map_agent = agent
            .as_any_mut()
            .downcast_mut::<MapAgent>()
            .expect("maps get a map agent");
        map_agent.set_allowed_key_types(Some(vec!["string".to_string()]));
        map_agent.set_allowed_value_types(Some(vec!["number".to_string()]));
    })
    .unwrap();
    sync(&mut host, &mut peer, &link);

    let set = |key: serde_json::Value, value: serde_json::Value| {
        vec![Message::Change {
            object_id: map_id.clone(),
            data: json!({ "changes": [{ "op": "set", "key": { "value": key }, "value": { "value": value } }] }),
        }]
    };

    // a permitted value under a rejected key
    assert!(matches!(
        host.apply_messages(&link.at_host, set(json!(1), json!(2))),
        Err(ObjectSyncError::DisallowedType { type_name, .. }) if type_name == "number"
    ));
    // a permitted key holding a rejected value
    assert!(matches!(
        host.apply_messages(&link.at_host, set(json!("a"), json!("text"))),
        Err(ObjectSyncError::DisallowedType { type_name, .. }) if type_name == "string"
    ));
    assert!(map.is_empty());

    host.apply_messages(&link.at_host, set(json!("a"), json!(2))).unwrap();
    assert_eq!(map.map_get(&Value::from("a")), Some(Value::from(2)));
}

#[test]
fn oversized_splices_are_clamped() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let list = Instance::new_observable_array(vec![Value::from(1), Value::from(2), Value::from(3)]);
    let list_id = host.track(&list, TrackOptions::default()).unwrap().object_id().clone();
    sync(&mut host, &mut peer, &link);

    let batch = vec![Message::Change {
        object_id: list_id,
        data: json!({ "splices": [
            { "start": 1, "deleteCount": u64::MAX, "items": [] },
            { "start": u64::MAX, "deleteCount": 1, "items": [{ "value": 4 }] }
        ] }),
    }];
    host.apply_messages(&link.at_host, batch).unwrap();
    assert_eq!(list.items(), vec![Value::from(1), Value::from(4)]);
}
