use std::sync::{Arc, Mutex};

use futures::{channel::oneshot, executor::block_on, FutureExt};
use objsync_shared::{
    DynamicObject, Instance, InvokeError, InvokeTarget, MessageKind, MethodReturn,
    ObjectSyncConfig, ObjectSyncCore, ObjectSyncError, ProviderRegistry, TrackOptions,
    TrackedMethod, TrackedProperty, TypeDescriptor, Value,
};
use objsync_test::{
    alpha, beta, connect, count_kind, deleted_ids, engine, init_logging, sync, ADMIN, GUEST,
};

type Completion = Arc<Mutex<Option<oneshot::Receiver<Value>>>>;

/// A `Job` whose `finish` settles once the test fires the completion.
fn job_protocol(completion: Completion) -> ProviderRegistry {
    ProviderRegistry::builder()
        .add_type(
            TypeDescriptor::new("Job")
                .property(TrackedProperty::new("state"))
                .method(TrackedMethod::new("finish").handler(move |_, _| {
                    match completion.lock().unwrap().take() {
                        Some(receiver) => MethodReturn::pending(
                            receiver
                                .map(|outcome| outcome.map_err(|_| Value::from("abandoned")))
                                .boxed(),
                        ),
                        None => MethodReturn::err("already finishing"),
                    }
                })),
        )
        .build()
}

#[test]
fn results_arrive_with_the_reply() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    host.track(&root, TrackOptions::default()).unwrap();
    sync(&mut host, &mut peer, &link);

    let mut results = host
        .invoke(&root, "greet", vec![Value::from("host")], InvokeTarget::All)
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].try_result().is_none());
    assert_eq!(host.pending_invocations(), 1);

    let batch = sync(&mut host, &mut peer, &link);
    assert_eq!(count_kind(&batch, MessageKind::Execute), 1);

    let outcome = results.remove(0).try_result().expect("reply arrived");
    assert_eq!(outcome.unwrap(), Value::from("root greets host"));
    assert_eq!(host.pending_invocations(), 0);
}

#[test]
fn handler_errors_come_back_as_remote_errors() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    host.track(&root, TrackOptions::default()).unwrap();
    sync(&mut host, &mut peer, &link);

    let mut results = host.invoke(&root, "fail", Vec::new(), InvokeTarget::All).unwrap();
    sync(&mut host, &mut peer, &link);

    let outcome = results[0].try_result().expect("reply arrived");
    assert!(matches!(outcome, Err(InvokeError::Remote(Value::String(message))) if message == "boom"));
}

#[test]
fn unauthorized_callers_are_refused() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    let root_id = host.track(&root, TrackOptions::default()).unwrap().object_id().clone();
    sync(&mut host, &mut peer, &link);

    let mut results = host.invoke(&root, "shutdown", Vec::new(), InvokeTarget::All).unwrap();
    sync(&mut host, &mut peer, &link);

    let outcome = results[0].try_result().expect("reply arrived");
    let Err(InvokeError::Remote(Value::Object(error))) = outcome else {
        panic!("expected an error object");
    };
    assert_eq!(error.error_value().unwrap().name, "NotAuthorizedError");
    assert_eq!(
        peer.instance_by_id(&root_id).unwrap().get("name"),
        Value::from("root")
    );
}

#[test]
fn authorized_callers_see_side_effects() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, ADMIN, &mut peer, "alice");

    let root = alpha("root");
    let root_id = host.track(&root, TrackOptions::default()).unwrap().object_id().clone();
    sync(&mut host, &mut peer, &link);

    let mut results = host.invoke(&root, "shutdown", Vec::new(), InvokeTarget::All).unwrap();
    sync(&mut host, &mut peer, &link);

    assert_eq!(results[0].try_result().unwrap().unwrap(), Value::from(true));
    assert_eq!(
        peer.instance_by_id(&root_id).unwrap().get("name"),
        Value::from("down")
    );
    assert_eq!(root.get("name"), Value::from("down"));
}

#[test]
fn arguments_are_sent_for_the_call_only() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    host.track(&root, TrackOptions::default()).unwrap();
    sync(&mut host, &mut peer, &link);

    let argument = beta("passenger");
    let mut results = host
        .invoke(&root, "echo", vec![Value::from(&argument)], InvokeTarget::All)
        .unwrap();
    let batch = sync(&mut host, &mut peer, &link);
    assert_eq!(count_kind(&batch, MessageKind::Create), 1);
    let argument_id = host.object_id(&argument).unwrap();

    let Ok(Value::Object(echoed)) = results[0].try_result().unwrap() else {
        panic!("expected the argument back");
    };
    assert!(echoed.ptr_eq(&argument));

    let batch = sync(&mut host, &mut peer, &link);
    assert_eq!(deleted_ids(&batch), vec![argument_id]);
    assert!(!host.is_tracked(&argument));
}

#[test]
fn invocations_skip_peers_that_may_not_see_the_method() {
    init_logging();
    let mut host = engine();
    let mut guest = engine();
    let mut bob = engine();
    let to_guest = connect(&mut host, "host", &mut guest, GUEST);
    let to_bob = connect(&mut host, "host", &mut bob, "bob");

    let root = alpha("root");
    host.track(&root, TrackOptions::default()).unwrap();
    sync(&mut host, &mut guest, &to_guest);
    sync(&mut host, &mut bob, &to_bob);

    let mut results = host.invoke(&root, "whisper", Vec::new(), InvokeTarget::All).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].client(), &to_bob.at_host);

    sync(&mut host, &mut bob, &to_bob);
    assert_eq!(results[0].try_result().unwrap().unwrap(), Value::from("psst"));

    let targeted = host
        .invoke(&root, "greet", Vec::new(), InvokeTarget::Client(to_guest.at_host.clone()))
        .unwrap();
    assert_eq!(targeted.len(), 1);
    assert_eq!(targeted[0].client(), &to_guest.at_host);
}

#[test]
fn naming_a_peer_the_method_is_hidden_from_fails() {
    init_logging();
    let mut host = engine();
    let mut guest = engine();
    let mut bob = engine();
    let to_guest = connect(&mut host, "host", &mut guest, GUEST);
    let to_bob = connect(&mut host, "host", &mut bob, "bob");

    let root = alpha("root");
    host.track(&root, TrackOptions::default()).unwrap();
    sync(&mut host, &mut guest, &to_guest);
    sync(&mut host, &mut bob, &to_bob);

    let refused = host.invoke(
        &root,
        "whisper",
        Vec::new(),
        InvokeTarget::Client(to_guest.at_host.clone()),
    );
    assert!(matches!(
        refused,
        Err(InvokeError::Sync(ObjectSyncError::NotAuthorized { member, .. })) if member == "whisper"
    ));

    // one refused name fails the whole call, bob gets nothing either
    let mixed = host.invoke(
        &root,
        "whisper",
        Vec::new(),
        InvokeTarget::Clients(vec![to_bob.at_host.clone(), to_guest.at_host.clone()]),
    );
    assert!(matches!(mixed, Err(InvokeError::Sync(ObjectSyncError::NotAuthorized { .. }))));
    assert_eq!(host.pending_invocations(), 0);

    let batch = sync(&mut host, &mut bob, &to_bob);
    assert_eq!(count_kind(&batch, MessageKind::Execute), 0);
    let batch = sync(&mut host, &mut guest, &to_guest);
    assert_eq!(count_kind(&batch, MessageKind::Execute), 0);
}

#[test]
fn pending_handlers_reply_in_a_later_cycle() {
    init_logging();
    let completion: Completion = Arc::new(Mutex::new(None));
    let mut host = ObjectSyncCore::new(job_protocol(Arc::new(Mutex::new(None))), ObjectSyncConfig::default());
    let mut peer = ObjectSyncCore::new(job_protocol(completion.clone()), ObjectSyncConfig::default());
    let link = connect(&mut host, "host", &mut peer, "alice");

    let job = Instance::new_object(DynamicObject::new("Job").with("state", "running"));
    host.track(&job, TrackOptions::default()).unwrap();
    sync(&mut host, &mut peer, &link);

    let (sender, receiver) = oneshot::channel();
    *completion.lock().unwrap() = Some(receiver);

    let mut results = host.invoke(&job, "finish", Vec::new(), InvokeTarget::All).unwrap();
    let batch = sync(&mut host, &mut peer, &link);
    assert_eq!(count_kind(&batch, MessageKind::Execute), 1);
    assert!(completion.lock().unwrap().is_none(), "handler ran on the peer");
    assert!(results[0].try_result().is_none());
    assert_eq!(host.pending_invocations(), 1);

    // still pending, nothing to report
    sync(&mut host, &mut peer, &link);
    assert!(results[0].try_result().is_none());

    sender.send(Value::from("done")).unwrap();
    sync(&mut host, &mut peer, &link);
    assert_eq!(results[0].try_result().unwrap().unwrap(), Value::from("done"));
    assert_eq!(host.pending_invocations(), 0);
}

#[test]
fn fire_and_forget_replies_immediately() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    host.track(&root, TrackOptions::default()).unwrap();
    sync(&mut host, &mut peer, &link);

    let mut results = host.invoke(&root, "notify", Vec::new(), InvokeTarget::All).unwrap();
    sync(&mut host, &mut peer, &link);
    assert_eq!(results[0].try_result().unwrap().unwrap(), Value::Null);
}

#[test]
fn bad_invocations_are_rejected_up_front() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    host.track(&root, TrackOptions::default()).unwrap();
    sync(&mut host, &mut peer, &link);

    assert!(matches!(
        host.invoke(&root, "missing", Vec::new(), InvokeTarget::All),
        Err(InvokeError::UnknownMethod { method }) if method == "missing"
    ));
    assert!(matches!(
        host.invoke(&alpha("stranger"), "greet", Vec::new(), InvokeTarget::All),
        Err(InvokeError::NotTracked)
    ));
    assert_eq!(host.pending_invocations(), 0);
}

#[test]
fn removed_peers_cancel_their_invocations() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    host.track(&root, TrackOptions::default()).unwrap();
    sync(&mut host, &mut peer, &link);

    let mut results = host.invoke(&root, "greet", Vec::new(), InvokeTarget::All).unwrap();
    host.unregister_peer(&link.at_host).unwrap();

    assert!(matches!(
        results[0].try_result(),
        Some(Err(InvokeError::Cancelled { reason })) if reason == "peer removed"
    ));
    assert_eq!(host.pending_invocations(), 0);
}

#[test]
fn dropping_the_engine_cancels_everything() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    host.track(&root, TrackOptions::default()).unwrap();
    sync(&mut host, &mut peer, &link);

    let results = host.invoke(&root, "greet", Vec::new(), InvokeTarget::All).unwrap();
    drop(host);

    for result in results {
        assert!(matches!(
            block_on(result),
            Err(InvokeError::Cancelled { reason }) if reason == "engine dropped"
        ));
    }
}

#[test]
fn deleting_the_object_cancels_its_invocations() {
    init_logging();
    let mut host = engine();
    let mut peer = engine();
    let link = connect(&mut host, "host", &mut peer, "alice");

    let root = alpha("root");
    host.track(&root, TrackOptions::default()).unwrap();
    sync(&mut host, &mut peer, &link);

    let mut results = host.invoke(&root, "greet", Vec::new(), InvokeTarget::All).unwrap();
    host.untrack(&root);
    let batch = sync(&mut host, &mut peer, &link);

    assert_eq!(count_kind(&batch, MessageKind::Delete), 1);
    assert!(matches!(
        results[0].try_result(),
        Some(Err(InvokeError::Cancelled { reason })) if reason == "object deleted"
    ));
}
