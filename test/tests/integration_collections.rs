use objsync_shared::{
    ChangeSetMode, DynamicObject, ErrorKind, ErrorValue, Instance, Message, MessageKind, Mutation,
    ObjectId, ObjectSyncCore, SpliceInstruction, TrackOptions, Value,
};
use objsync_test::{beta, connect, count_kind, engine, init_logging, sync, Connection};
use proptest::prelude::*;
use serde_json::json;

struct Fixture {
    host: ObjectSyncCore,
    peer: ObjectSyncCore,
    link: Connection,
    root_id: ObjectId,
    list: Instance,
    map: Instance,
    set: Instance,
    date: Instance,
}

fn copy_of(peer: &ObjectSyncCore, root_id: &ObjectId, key: &str) -> Instance {
    let root = peer.instance_by_id(root_id).expect("root copy");
    match root.get(key) {
        Value::Object(instance) => instance,
        other => panic!("{} is not an object: {:?}", key, other),
    }
}

fn fixture() -> Fixture {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let list = Instance::new_array(vec![Value::from(1), Value::from("two"), Value::from(&beta("item"))]);
    let map = Instance::new_observable_map(vec![(Value::from("a"), Value::from(1))]);
    let set = Instance::new_observable_set(vec![Value::from("x")]);
    let date = Instance::new_simple("Date", json!("2024-01-01T00:00:00Z"));
    let failure = Instance::new_error(
        ErrorValue::new(ErrorKind::TypeError, "bad input").with_stack("at parse"),
    );
    let root = Instance::new_object(
        DynamicObject::new("Object")
            .with("list", &list)
            .with("map", &map)
            .with("set", &set)
            .with("date", &date)
            .with("failure", &failure),
    );
    let root_id = host.track(&root, TrackOptions::default()).unwrap().object_id().clone();

    Fixture {
        host,
        peer,
        link,
        root_id,
        list,
        map,
        set,
        date,
    }
}

#[test]
fn every_collection_kind_is_created() {
    let mut fixture = fixture();
    let batch = sync(&mut fixture.host, &mut fixture.peer, &fixture.link);
    // root, list, list item, map, set, date, error
    assert_eq!(count_kind(&batch, MessageKind::Create), 7);

    let peer = &fixture.peer;
    let list = copy_of(peer, &fixture.root_id, "list");
    let items = list.items();
    assert_eq!(items[..2], [Value::from(1), Value::from("two")]);
    let Value::Object(item) = &items[2] else {
        panic!("list item did not resolve");
    };
    assert_eq!(item.get("label"), Value::from("item"));

    let map = copy_of(peer, &fixture.root_id, "map");
    assert_eq!(map.map_entries(), fixture.map.map_entries());
    assert!(map.is_observable());

    let set = copy_of(peer, &fixture.root_id, "set");
    assert_eq!(set.set_values(), vec![Value::from("x")]);

    let date = copy_of(peer, &fixture.root_id, "date");
    assert_eq!(date.type_name(), "Date");
    assert_eq!(date.simple_value(), Some(json!("2024-01-01T00:00:00Z")));

    let failure = copy_of(peer, &fixture.root_id, "failure").error_value().unwrap();
    assert_eq!(failure.message, "bad input");
    assert_eq!(failure.name, "TypeError");
    assert_eq!(failure.stack.as_deref(), Some("at parse"));
}

#[test]
fn collection_changes_converge() {
    let mut fixture = fixture();
    sync(&mut fixture.host, &mut fixture.peer, &fixture.link);

    fixture.list.remove(0);
    fixture.list.push(3);
    fixture.map.map_set("b", 2);
    fixture.map.map_delete(&Value::from("a"));
    fixture.set.set_add("y");
    fixture.set.set_delete(&Value::from("x"));
    fixture.date.set_simple_value(json!("2025-06-01T00:00:00Z"));

    let batch = sync(&mut fixture.host, &mut fixture.peer, &fixture.link);
    assert_eq!(count_kind(&batch, MessageKind::Change), 4);
    assert_eq!(count_kind(&batch, MessageKind::Create), 0);

    let peer = &fixture.peer;
    let list = copy_of(peer, &fixture.root_id, "list").items();
    assert_eq!(list.len(), 3);
    assert_eq!(list[0], Value::from("two"));
    assert_eq!(list[2], Value::from(3));
    assert_eq!(
        copy_of(peer, &fixture.root_id, "map").map_entries(),
        vec![(Value::from("b"), Value::from(2))]
    );
    assert_eq!(
        copy_of(peer, &fixture.root_id, "set").set_values(),
        vec![Value::from("y")]
    );
    assert_eq!(
        copy_of(peer, &fixture.root_id, "date").simple_value(),
        Some(json!("2025-06-01T00:00:00Z"))
    );
}

#[test]
fn removed_list_items_are_deleted() {
    let mut fixture = fixture();
    sync(&mut fixture.host, &mut fixture.peer, &fixture.link);
    assert_eq!(fixture.peer.tracked_count(), 7);

    fixture.list.remove(2);
    let batch = sync(&mut fixture.host, &mut fixture.peer, &fixture.link);
    assert_eq!(count_kind(&batch, MessageKind::Delete), 1);
    assert_eq!(fixture.host.tracked_count(), 6);
    assert_eq!(fixture.peer.tracked_count(), 6);
}

fn shared_collections() -> (Instance, Instance, Instance, Instance) {
    let list = Instance::new_observable_array(vec![Value::from(1)]);
    let map = Instance::new_observable_map(vec![(Value::from("a"), Value::from(1))]);
    let set = Instance::new_observable_set(vec![Value::from("x")]);
    let root = Instance::new_object(
        DynamicObject::new("Object")
            .with("list", &list)
            .with("map", &map)
            .with("set", &set),
    );
    (root, list, map, set)
}

#[test]
fn peer_edits_reach_the_other_peers() {
    init_logging();
    let mut host = engine();
    let mut alice = engine();
    let mut bob = engine();
    let to_alice = connect(&mut host, "host", &mut alice, "alice");
    let to_bob = connect(&mut host, "host", &mut bob, "bob");

    let (root, list, map, set) = shared_collections();
    let root_id = host.track(&root, TrackOptions::default()).unwrap().object_id().clone();
    sync(&mut host, &mut alice, &to_alice);
    sync(&mut host, &mut bob, &to_bob);

    copy_of(&alice, &root_id, "list").push(2);
    let alice_map = copy_of(&alice, &root_id, "map");
    alice_map.map_set("b", 2);
    alice_map.map_delete(&Value::from("a"));
    copy_of(&alice, &root_id, "set").set_add("y");

    sync(&mut host, &mut alice, &to_alice);
    assert_eq!(list.items(), vec![Value::from(1), Value::from(2)]);
    assert_eq!(map.map_entries(), vec![(Value::from("b"), Value::from(2))]);
    assert_eq!(set.set_values(), vec![Value::from("x"), Value::from("y")]);

    let batch = sync(&mut host, &mut bob, &to_bob);
    assert_eq!(count_kind(&batch, MessageKind::Change), 3);
    assert_eq!(copy_of(&bob, &root_id, "list").items(), list.items());
    assert_eq!(copy_of(&bob, &root_id, "map").map_entries(), map.map_entries());
    assert_eq!(copy_of(&bob, &root_id, "set").set_values(), set.set_values());

    // alice already has her own edits
    let echo = sync(&mut host, &mut alice, &to_alice);
    assert_eq!(count_kind(&echo, MessageKind::Change), 0);
}

#[test]
fn interleaved_array_edits_converge_everywhere() {
    init_logging();
    let mut host = engine();
    let mut alice = engine();
    let mut bob = engine();
    let to_alice = connect(&mut host, "host", &mut alice, "alice");
    let to_bob = connect(&mut host, "host", &mut bob, "bob");

    let (root, list, _map, _set) = shared_collections();
    let root_id = host.track(&root, TrackOptions::default()).unwrap().object_id().clone();
    sync(&mut host, &mut alice, &to_alice);
    sync(&mut host, &mut bob, &to_bob);

    // the host edits first, then applies alice's edit in the same cycle
    list.push(5);
    copy_of(&alice, &root_id, "list").push(2);
    let reply = alice.get_messages(&to_alice.at_peer).unwrap();
    host.apply_messages(&to_alice.at_host, reply).unwrap();
    alice.clear_states().unwrap();
    assert_eq!(list.items(), vec![Value::from(1), Value::from(2), Value::from(5)]);

    // one cycle for both peers
    let to_alice_batch = host.get_messages(&to_alice.at_host).unwrap();
    let to_bob_batch = host.get_messages(&to_bob.at_host).unwrap();
    host.clear_states().unwrap();
    alice.apply_messages(&to_alice.at_peer, to_alice_batch).unwrap();
    bob.apply_messages(&to_bob.at_peer, to_bob_batch).unwrap();

    assert_eq!(copy_of(&alice, &root_id, "list").items(), list.items());
    assert_eq!(copy_of(&bob, &root_id, "list").items(), list.items());
}

#[test]
fn reported_splices_arrive_as_one_change() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let array = Instance::new_array(vec![Value::from(1), Value::from(2)]);
    let array_id = host.track(&array, TrackOptions::default()).unwrap().object_id().clone();
    sync(&mut host, &mut peer, &link);

    array.push(3);
    host.report_splice(&array, SpliceInstruction::new(2, 0, vec![Value::from(3)]))
        .unwrap();
    host.configure_agent(&array, |agent| agent.set_change_set_mode(ChangeSetMode::TrackSplices))
        .unwrap()
        .unwrap();
    sync(&mut host, &mut peer, &link);
    assert_eq!(peer.instance_by_id(&array_id).unwrap().items(), array.items());

    for value in [4, 5] {
        array.push(value);
        let start = array.len() - 1;
        host.report_splice(&array, SpliceInstruction::new(start, 0, vec![Value::from(value)]))
            .unwrap();
    }
    let batch = sync(&mut host, &mut peer, &link);
    let changes: Vec<&Message> = batch
        .iter()
        .filter(|message| message.kind() == MessageKind::Change)
        .collect();
    assert_eq!(changes.len(), 1);
    let Message::Change { data, .. } = changes[0] else {
        unreachable!();
    };
    assert_eq!(data["splices"].as_array().map(Vec::len), Some(1));
    assert_eq!(data["splices"][0]["start"], json!(3));
    assert_eq!(data["splices"][0]["deleteCount"], json!(0));
    assert_eq!(data["splices"][0]["items"].as_array().map(Vec::len), Some(2));
    assert_eq!(
        peer.instance_by_id(&array_id).unwrap().items(),
        (1..=5).map(Value::from).collect::<Vec<_>>()
    );
}

#[test]
fn reported_map_changes_reach_the_peer() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let map = Instance::new_map(vec![(Value::from("a"), Value::from(1))]);
    let map_id = host.track(&map, TrackOptions::default()).unwrap().object_id().clone();
    sync(&mut host, &mut peer, &link);

    map.map_set("b", 2);
    host.report_change(
        &map,
        Mutation::MapSet {
            key: Value::from("b"),
            value: Value::from(2),
            previously_present: false,
        },
    )
    .unwrap();
    host.configure_agent(&map, |agent| agent.set_change_set_mode(ChangeSetMode::TrackSplices))
        .unwrap()
        .unwrap();
    sync(&mut host, &mut peer, &link);

    map.map_delete(&Value::from("a"));
    host.report_change(&map, Mutation::MapDelete { key: Value::from("a") })
        .unwrap();
    let batch = sync(&mut host, &mut peer, &link);
    assert_eq!(count_kind(&batch, MessageKind::Change), 1);
    assert_eq!(
        peer.instance_by_id(&map_id).unwrap().map_entries(),
        vec![(Value::from("b"), Value::from(2))]
    );
}

#[derive(Clone, Debug)]
enum ArrayOp {
    Push(i32),
    Remove(usize),
    Splice(usize, usize, Vec<i32>),
    Set(usize, i32),
}

fn array_op() -> impl Strategy<Value = ArrayOp> {
    prop_oneof![
        any::<i32>().prop_map(ArrayOp::Push),
        (0usize..8).prop_map(ArrayOp::Remove),
        (0usize..8, 0usize..4, prop::collection::vec(any::<i32>(), 0..4))
            .prop_map(|(start, delete_count, items)| ArrayOp::Splice(start, delete_count, items)),
        (0usize..10, any::<i32>()).prop_map(|(index, value)| ArrayOp::Set(index, value)),
    ]
}

fn apply(array: &Instance, op: &ArrayOp) {
    match op {
        ArrayOp::Push(value) => array.push(*value),
        ArrayOp::Remove(index) => {
            if *index < array.len() {
                array.remove(*index);
            }
        }
        ArrayOp::Splice(start, delete_count, items) => {
            array.splice(*start, *delete_count, items.iter().copied().map(Value::from).collect());
        }
        ArrayOp::Set(index, value) => array.set_index(*index, *value),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn observable_arrays_converge(
        initial in prop::collection::vec(any::<i32>(), 0..6),
        rounds in prop::collection::vec(prop::collection::vec(array_op(), 0..6), 1..5),
    ) {
        let mut host = engine();
        let mut peer = engine();
        let link = connect(&mut host, "host", &mut peer, "alice");

        let array = Instance::new_observable_array(initial.into_iter().map(Value::from).collect());
        let array_id = host.track(&array, TrackOptions::default()).unwrap().object_id().clone();
        sync(&mut host, &mut peer, &link);

        for round in rounds {
            for op in &round {
                apply(&array, op);
            }
            sync(&mut host, &mut peer, &link);
            let copy = peer.instance_by_id(&array_id).unwrap();
            prop_assert_eq!(copy.items(), array.items());
        }
    }
}
