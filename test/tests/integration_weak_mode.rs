use objsync_shared::{
    DynamicObject, Instance, MemoryManagementMode, MessageKind, ObjectSyncConfig, TrackOptions,
    Value,
};
use objsync_test::{
    alpha, beta, connect, count_kind, deleted_ids, engine, engine_with, init_logging, sync,
};

fn weak_config() -> ObjectSyncConfig {
    ObjectSyncConfig {
        memory_management: MemoryManagementMode::Weak,
        ..Default::default()
    }
}

#[test]
fn unreferenced_objects_wait_for_reclamation() {
    init_logging();
    let mut host = engine_with(weak_config());
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    let child = beta("child");
    root.set("beta", &child);
    host.track(&root, TrackOptions::default()).unwrap();
    sync(&mut host, &mut peer, &link);
    let child_id = host.object_id(&child).unwrap();

    root.set("beta", Value::Null);
    let batch = sync(&mut host, &mut peer, &link);
    assert_eq!(count_kind(&batch, MessageKind::Delete), 0);
    assert_eq!(host.weakly_held_count(), 1);
    assert_eq!(peer.tracked_count(), 2);

    // still alive, so nothing is sent
    assert!(sync(&mut host, &mut peer, &link).is_empty());

    drop(child);
    let batch = sync(&mut host, &mut peer, &link);
    assert_eq!(deleted_ids(&batch), vec![child_id]);
    assert_eq!(host.weakly_held_count(), 0);
    assert_eq!(peer.tracked_count(), 1);
}

#[test]
fn removed_collection_members_can_be_reclaimed() {
    init_logging();
    let mut host = engine_with(weak_config());
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let child = beta("child");
    let set = Instance::new_observable_set(vec![Value::from(&child)]);
    let map = Instance::new_observable_map(vec![(Value::from(&child), Value::from(1))]);
    let root = Instance::new_object(DynamicObject::new("Object").with("set", &set).with("map", &map));
    host.track(&root, TrackOptions::default()).unwrap();
    sync(&mut host, &mut peer, &link);
    let child_id = host.object_id(&child).unwrap();

    set.set_delete(&Value::from(&child));
    map.map_delete(&Value::from(&child));
    let batch = sync(&mut host, &mut peer, &link);
    assert_eq!(count_kind(&batch, MessageKind::Change), 2);
    assert_eq!(count_kind(&batch, MessageKind::Delete), 0);
    sync(&mut host, &mut peer, &link);
    assert_eq!(host.weakly_held_count(), 1);

    // nothing inside the engine may keep the former key alive
    drop(child);
    let batch = sync(&mut host, &mut peer, &link);
    assert_eq!(deleted_ids(&batch), vec![child_id]);
    assert_eq!(host.weakly_held_count(), 0);
}

#[test]
fn weakly_held_objects_keep_their_id() {
    init_logging();
    let mut host = engine_with(weak_config());
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    let child = beta("child");
    root.set("beta", &child);
    host.track(&root, TrackOptions::default()).unwrap();
    sync(&mut host, &mut peer, &link);
    let child_id = host.object_id(&child).unwrap();

    root.set("beta", Value::Null);
    sync(&mut host, &mut peer, &link);
    assert!(!host.is_tracked(&child));

    root.set("beta", &child);
    let batch = sync(&mut host, &mut peer, &link);
    assert_eq!(count_kind(&batch, MessageKind::Create), 0);
    assert_eq!(host.object_id(&child), Some(child_id));
    assert_eq!(host.weakly_held_count(), 0);
}

#[test]
fn strong_mode_deletes_without_waiting() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    let child = beta("child");
    root.set("beta", &child);
    host.track(&root, TrackOptions::default()).unwrap();
    sync(&mut host, &mut peer, &link);

    root.set("beta", Value::Null);
    let batch = sync(&mut host, &mut peer, &link);
    assert_eq!(count_kind(&batch, MessageKind::Delete), 1);
    assert_eq!(host.weakly_held_count(), 0);
}
