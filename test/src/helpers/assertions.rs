use objsync_shared::{Message, MessageKind, ObjectId};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn count_kind(messages: &[Message], kind: MessageKind) -> usize {
    messages.iter().filter(|message| message.kind() == kind).count()
}

pub fn created_ids(messages: &[Message]) -> Vec<ObjectId> {
    ids_of(messages, MessageKind::Create)
}

pub fn deleted_ids(messages: &[Message]) -> Vec<ObjectId> {
    ids_of(messages, MessageKind::Delete)
}

fn ids_of(messages: &[Message], kind: MessageKind) -> Vec<ObjectId> {
    messages
        .iter()
        .filter(|message| message.kind() == kind)
        .map(|message| message.object_id().clone())
        .collect()
}
