use std::collections::HashMap;

use futures::{executor::block_on, future};
use objsync_shared::{ClientToken, Message, ObjectSyncCore, ObjectSyncError, TrackOptions, Value};
use objsync_test::{alpha, beta, connect, engine, init_logging, Connection};

/// Delivers `outgoing` to `peer` and returns its answer.
fn deliver(peer: &mut ObjectSyncCore, link: &Connection, outgoing: Vec<Message>) -> Result<Vec<Message>, ObjectSyncError> {
    peer.apply_messages(&link.at_peer, outgoing)?;
    let reply = peer.get_messages(&link.at_peer)?;
    peer.clear_states()?;
    Ok(reply)
}

fn deliver_all(
    peers: Vec<(&mut ObjectSyncCore, &Connection)>,
    mut outgoing: HashMap<ClientToken, Vec<Message>>,
) -> Result<HashMap<ClientToken, Vec<Message>>, ObjectSyncError> {
    let mut replies = HashMap::new();
    for (peer, link) in peers {
        let batch = outgoing.remove(&link.at_host).unwrap_or_default();
        replies.insert(link.at_host.clone(), deliver(peer, link, batch)?);
    }
    Ok(replies)
}

#[test]
fn exchange_runs_a_full_cycle() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    root.set("beta", &beta("child"));
    let root_id = host.track(&root, TrackOptions::default()).unwrap().object_id().clone();

    block_on(host.exchange_messages(|_, outgoing| future::ready(deliver(&mut peer, &link, outgoing)))).unwrap();
    assert_eq!(peer.tracked_count(), 2);

    peer.instance_by_id(&root_id).unwrap().set("name", "from peer");
    root.set("beta", Value::Null);
    block_on(host.exchange_messages(|_, outgoing| future::ready(deliver(&mut peer, &link, outgoing)))).unwrap();

    assert_eq!(root.get("name"), Value::from("from peer"));
    assert_eq!(peer.tracked_count(), 1);
    assert_eq!(host.tracked_count(), 1);
}

#[test]
fn transport_errors_abort_the_cycle() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let _link = connect(&mut host, "host", &mut peer, "alice");

    host.track(&alpha("root"), TrackOptions::default()).unwrap();
    let result = block_on(host.exchange_messages(|client, _| {
        future::ready(Err::<Vec<Message>, _>(ObjectSyncError::UnknownPeer {
            identity: client.identity().to_string(),
        }))
    }));
    assert!(matches!(result, Err(ObjectSyncError::UnknownPeer { .. })));
}

#[test]
fn bulk_exchange_reaches_every_peer() {
    init_logging();
    let mut host = engine();
    let mut first = engine();
    let mut second = engine();
    let to_first = connect(&mut host, "host", &mut first, "first");
    let to_second = connect(&mut host, "host", &mut second, "second");

    let root = alpha("root");
    let root_id = host.track(&root, TrackOptions::default()).unwrap().object_id().clone();

    let exchange = host.exchange_messages_bulk(|outgoing| {
        future::ready(deliver_all(
            vec![(&mut first, &to_first), (&mut second, &to_second)],
            outgoing,
        ))
    });
    block_on(exchange).unwrap();

    for peer in [&first, &second] {
        assert_eq!(
            peer.instance_by_id(&root_id).unwrap().get("name"),
            Value::from("root")
        );
    }
}
