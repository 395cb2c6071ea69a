use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures::channel::oneshot;
use log::debug;

use crate::{ClientToken, InvokeId, ObjectId, Value};

use super::InvokeError;

type InvokeOutcome = Result<Value, InvokeError>;

struct PendingInvocation {
    object_id: ObjectId,
    method: String,
    sender: oneshot::Sender<InvokeOutcome>,
}

/// Correlates outbound `execute` messages with the `executeFinished`
/// replies that settle them, one entry per (invoke id, peer).
pub struct InvocationManager {
    last_invoke_id: InvokeId,
    pending: HashMap<(InvokeId, ClientToken), PendingInvocation>,
}

impl InvocationManager {
    pub fn new() -> Self {
        Self {
            last_invoke_id: 0,
            pending: HashMap::new(),
        }
    }

    pub fn next_invoke_id(&mut self) -> InvokeId {
        self.last_invoke_id += 1;
        self.last_invoke_id
    }

    pub fn register(
        &mut self,
        invoke_id: InvokeId,
        client: &ClientToken,
        object_id: &ObjectId,
        method: &str,
    ) -> InvokeResult {
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(
            (invoke_id, client.clone()),
            PendingInvocation {
                object_id: object_id.clone(),
                method: method.to_string(),
                sender,
            },
        );
        InvokeResult {
            invoke_id,
            client: client.clone(),
            receiver,
        }
    }

    /// Method name of an invocation still waiting for `client`.
    pub fn method_of(&self, invoke_id: InvokeId, client: &ClientToken) -> Option<&str> {
        self.pending
            .get(&(invoke_id, client.clone()))
            .map(|pending| pending.method.as_str())
    }

    /// Settles an invocation. False when nothing was waiting for it.
    pub fn resolve(&mut self, invoke_id: InvokeId, client: &ClientToken, outcome: InvokeOutcome) -> bool {
        let Some(pending) = self.pending.remove(&(invoke_id, client.clone())) else {
            return false;
        };
        // the caller may have dropped its result handle
        let _ = pending.sender.send(outcome);
        true
    }

    fn cancel_where(&mut self, reason: &str, predicate: impl Fn(&ObjectId, &ClientToken) -> bool) {
        let keys: Vec<(InvokeId, ClientToken)> = self
            .pending
            .iter()
            .filter(|((_, client), pending)| predicate(&pending.object_id, client))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(pending) = self.pending.remove(&key) {
                debug!(
                    "Cancelling invocation {} of {} on {}: {}",
                    key.0, pending.method, pending.object_id, reason
                );
                let _ = pending.sender.send(Err(InvokeError::Cancelled {
                    reason: reason.to_string(),
                }));
            }
        }
    }

    pub fn cancel_client(&mut self, client: &ClientToken, reason: &str) {
        self.cancel_where(reason, |_, pending_client| pending_client == client);
    }

    pub fn cancel_object(&mut self, object_id: &ObjectId, reason: &str) {
        self.cancel_where(reason, |pending_object, _| pending_object == object_id);
    }

    pub fn cancel_object_for(&mut self, object_id: &ObjectId, client: &ClientToken, reason: &str) {
        self.cancel_where(reason, |pending_object, pending_client| {
            pending_object == object_id && pending_client == client
        });
    }

    pub fn cancel_all(&mut self, reason: &str) {
        self.cancel_where(reason, |_, _| true);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for InvocationManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of invoking a method on one peer. Resolves when the peer replies,
/// or with [`InvokeError::Cancelled`] when the peer or object goes away.
pub struct InvokeResult {
    invoke_id: InvokeId,
    client: ClientToken,
    receiver: oneshot::Receiver<InvokeOutcome>,
}

impl InvokeResult {
    pub fn invoke_id(&self) -> InvokeId {
        self.invoke_id
    }

    pub fn client(&self) -> &ClientToken {
        &self.client
    }

    /// The outcome, if it has arrived. Taking it consumes it.
    pub fn try_result(&mut self) -> Option<InvokeOutcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => outcome,
            Err(oneshot::Canceled) => Some(Err(dropped())),
        }
    }
}

fn dropped() -> InvokeError {
    InvokeError::Cancelled {
        reason: "engine dropped".to_string(),
    }
}

impl Future for InvokeResult {
    type Output = InvokeOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(dropped())),
            Poll::Pending => Poll::Pending,
        }
    }
}
