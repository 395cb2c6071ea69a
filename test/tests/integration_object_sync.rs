use objsync_shared::{
    MessageKind, ObjectId, ObjectSyncConfig, ObjectSyncError, SyncEvent, TrackOptions, Value,
};
use objsync_test::{
    alpha, beta, connect, count_kind, created_ids, deleted_ids, engine, engine_with, init_logging,
    sync,
};

#[test]
fn clearing_a_reference_deletes_the_child() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    let child = beta("child");
    root.set("beta", &child);
    host.track(&root, TrackOptions::default()).unwrap();

    let first = sync(&mut host, &mut peer, &link);
    assert_eq!(first.len(), 2);
    assert_eq!(count_kind(&first, MessageKind::Create), 2);

    root.set("beta", Value::Null);
    let second = sync(&mut host, &mut peer, &link);
    assert_eq!(second.len(), 2);
    assert_eq!(count_kind(&second, MessageKind::Change), 1);
    assert_eq!(count_kind(&second, MessageKind::Delete), 1);

    assert_eq!(host.tracked_count(), 1);
    assert_eq!(peer.tracked_count(), 1);
}

#[test]
fn second_generation_without_changes_is_empty() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    host.track(&root, TrackOptions::default()).unwrap();

    assert!(!host.get_messages(&link.at_host).unwrap().is_empty());
    assert!(host.get_messages(&link.at_host).unwrap().is_empty());

    root.set("name", "renamed");
    assert_eq!(host.get_messages(&link.at_host).unwrap().len(), 1);
    assert!(host.get_messages(&link.at_host).unwrap().is_empty());
}

#[test]
fn reference_and_create_can_share_a_batch() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    let root_id = host.track(&root, TrackOptions::default()).unwrap().object_id().clone();
    sync(&mut host, &mut peer, &link);

    let child = beta("late");
    root.set("beta", &child);
    let batch = sync(&mut host, &mut peer, &link);

    // the change naming the child goes out before the child's create
    assert_eq!(batch[0].kind(), MessageKind::Change);
    assert_eq!(batch[1].kind(), MessageKind::Create);

    let copy = peer.instance_by_id(&root_id).unwrap();
    let Value::Object(copied_child) = copy.get("beta") else {
        panic!("child reference did not resolve");
    };
    assert_eq!(copied_child.get("label"), Value::from("late"));
}

#[test]
fn creates_apply_in_any_order() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    root.set("beta", &beta("child"));
    let root_id = host.track(&root, TrackOptions::default()).unwrap().object_id().clone();

    let mut batch = host.get_messages(&link.at_host).unwrap();
    batch.reverse();
    peer.apply_messages(&link.at_peer, batch).unwrap();

    let copy = peer.instance_by_id(&root_id).unwrap();
    assert!(matches!(copy.get("beta"), Value::Object(_)));
    assert_eq!(peer.tracked_count(), 2);
}

#[test]
fn retracked_child_gets_a_fresh_id() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    let child = beta("child");
    root.set("beta", &child);
    host.track(&root, TrackOptions::default()).unwrap();
    sync(&mut host, &mut peer, &link);
    let old_id = host.object_id(&child).unwrap();

    root.set("beta", Value::Null);
    let removal = sync(&mut host, &mut peer, &link);
    assert_eq!(deleted_ids(&removal), vec![old_id.clone()]);
    assert!(host.object_id(&child).is_none());

    root.set("beta", &child);
    let readd = sync(&mut host, &mut peer, &link);
    let new_id = host.object_id(&child).unwrap();
    assert_eq!(created_ids(&readd), vec![new_id.clone()]);
    assert_ne!(new_id, old_id);
    assert_eq!(count_kind(&readd, MessageKind::Delete), 0);
}

#[test]
fn readding_before_the_flush_deletes_nothing() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    let child = beta("child");
    root.set("beta", &child);
    host.track(&root, TrackOptions::default()).unwrap();
    sync(&mut host, &mut peer, &link);
    let child_id = host.object_id(&child).unwrap();

    root.set("beta", Value::Null);
    root.set("beta", &child);
    let batch = sync(&mut host, &mut peer, &link);

    assert_eq!(count_kind(&batch, MessageKind::Delete), 0);
    assert_eq!(count_kind(&batch, MessageKind::Create), 0);
    assert_eq!(host.object_id(&child), Some(child_id));
}

#[test]
fn unregistering_a_peer_releases_its_references() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    root.set("beta", &beta("child"));
    host.track(&root, TrackOptions::default()).unwrap();
    sync(&mut host, &mut peer, &link);
    assert_eq!(host.tracked_count(), 2);

    host.unregister_peer(&link.at_host).unwrap();
    host.clear_states().unwrap();
    assert_eq!(host.tracked_count(), 1);
    assert!(host.known_clients(&root).is_empty());
    assert!(matches!(
        host.get_messages(&link.at_host),
        Err(ObjectSyncError::UnknownPeer { .. })
    ));
}

#[test]
fn untracked_root_is_deleted_for_peers() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    let root_id = host.track(&root, TrackOptions::default()).unwrap().object_id().clone();
    sync(&mut host, &mut peer, &link);

    assert!(host.untrack(&root));
    assert!(!host.untrack(&root));
    let batch = sync(&mut host, &mut peer, &link);
    assert_eq!(deleted_ids(&batch), vec![root_id]);
    assert_eq!(host.tracked_count(), 0);
    assert_eq!(peer.tracked_count(), 0);
}

#[test]
fn explicit_ids_must_not_conflict() {
    init_logging();
    let mut host = engine_with(ObjectSyncConfig {
        id_prefix: "host".to_string(),
        ..Default::default()
    });
    let root = alpha("root");

    let handle = host.track(&root, TrackOptions::with_id("main")).unwrap();
    assert_eq!(handle.object_id(), &ObjectId::from("main"));
    assert!(host.track(&root, TrackOptions::with_id("main")).is_ok());
    assert!(matches!(
        host.track(&root, TrackOptions::with_id("other")),
        Err(ObjectSyncError::AlreadyTracked { .. })
    ));
    assert!(matches!(
        host.track(&alpha("second"), TrackOptions::with_id("main")),
        Err(ObjectSyncError::ObjectAlreadyExists { .. })
    ));

    let generated = host.track(&alpha("third"), TrackOptions::default()).unwrap();
    assert_eq!(generated.object_id(), &ObjectId::from("host-1"));
}

#[test]
fn peer_events_describe_applied_messages() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    root.set("beta", &beta("child"));
    let root_id = host.track(&root, TrackOptions::default()).unwrap().object_id().clone();
    sync(&mut host, &mut peer, &link);

    let events = peer.take_events();
    assert_eq!(events.len(), 2);
    assert!(events
        .iter()
        .all(|event| matches!(event, SyncEvent::Created { client, .. } if *client == link.at_peer)));

    root.set("name", "changed");
    sync(&mut host, &mut peer, &link);
    let events = peer.take_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].object_id(), &root_id);
    assert!(matches!(&events[0], SyncEvent::Changed { .. }));
    assert_eq!(
        peer.instance_by_id(&root_id).unwrap().get("name"),
        Value::from("changed")
    );
}

#[test]
fn peer_writes_flow_back_to_the_owner() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    let root_id = host.track(&root, TrackOptions::default()).unwrap().object_id().clone();
    sync(&mut host, &mut peer, &link);

    peer.instance_by_id(&root_id).unwrap().set("name", "from peer");
    sync(&mut host, &mut peer, &link);
    assert_eq!(root.get("name"), Value::from("from peer"));

    // the writer is not sent its own value back
    let echoed = sync(&mut host, &mut peer, &link);
    assert!(echoed.is_empty());
}
