//! Types shared by the integration tests

use futures::FutureExt;
use objsync_shared::{
    ClientToken, DynamicObject, Instance, MethodReturn, PromiseHandling, ProviderRegistry,
    TrackedMethod, TrackedProperty, TypeDescriptor, Value,
};

/// Peer identity that may not see secrets
pub const GUEST: &str = "guest";
/// Peer identity allowed to call `shutdown`
pub const ADMIN: &str = "admin";

fn not_guest(client: &ClientToken) -> bool {
    client.identity() != GUEST
}

fn text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        _ => String::new(),
    }
}

pub fn alpha(name: &str) -> Instance {
    Instance::new_object(
        DynamicObject::new("Alpha")
            .with("name", name)
            .with("secret", "hunter2")
            .with("beta", Value::Null),
    )
}

pub fn beta(label: &str) -> Instance {
    Instance::new_object(DynamicObject::new("Beta").with("label", label))
}

pub fn gamma(size: i32) -> Instance {
    Instance::new_object(DynamicObject::new("Gamma").with("size", size).with("tag", "new"))
}

pub fn protocol() -> ProviderRegistry {
    ProviderRegistry::builder()
        .add_type(
            TypeDescriptor::new("Alpha")
                .property(TrackedProperty::new("name"))
                .property(TrackedProperty::new("secret").can_track(not_guest))
                .property(TrackedProperty::new("beta").allowed_types_from_sender(&["Beta"]))
                .method(TrackedMethod::new("greet").handler(|instance, args| {
                    let caller = args.first().map(text).unwrap_or_default();
                    MethodReturn::ok(format!("{} greets {}", text(&instance.get("name")), caller))
                }))
                .method(TrackedMethod::new("fail").handler(|_, _| MethodReturn::err("boom")))
                .method(
                    TrackedMethod::new("shutdown")
                        .can_apply(|client| client.identity() == ADMIN)
                        .handler(|instance, _| {
                            instance.set("name", "down");
                            MethodReturn::ok(true)
                        }),
                )
                .method(
                    TrackedMethod::new("echo")
                        .handler(|_, args| MethodReturn::ok(args.into_iter().next().unwrap_or_default())),
                )
                .method(TrackedMethod::new("whisper").can_track(not_guest).handler(|_, _| MethodReturn::ok("psst")))
                .method(
                    TrackedMethod::new("notify")
                        .promise_handling(PromiseHandling::FireAndForget)
                        .handler(|_, _| MethodReturn::pending(futures::future::ready(Ok(Value::from(7))).boxed())),
                ),
        )
        .add_type(TypeDescriptor::new("Beta").property(TrackedProperty::new("label")))
        .add_type(
            TypeDescriptor::new("Gamma")
                .property(TrackedProperty::new("size").constructor_argument())
                .property(TrackedProperty::new("tag")),
        )
        .add_simple_type("Date")
        .build()
}
