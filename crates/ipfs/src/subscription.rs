use std::{
    sync::Arc,
    time::Duration,
};

use futures::{
    Stream,
    StreamExt,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::message::TopicMessage;

/// A live subscription on one machine's topic.
///
/// Messages are pumped off the transport by a background task and fanned out
/// to the registered handlers, then offered to at most one matching one-shot
/// waiter. Handlers run on the pump task and must not block; they are
/// expected to spawn any real work.
pub struct TopicSubscription {
    state: Arc<SubscriptionState>,
    pump: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct SubscriptionState {
    handlers: Mutex<Vec<Handler>>,
    waiters: Mutex<Vec<Waiter>>,
}

type Handler = Box<dyn Fn(&TopicMessage) + Send + Sync>;

struct Waiter {
    predicate: Box<dyn Fn(&TopicMessage) -> bool + Send + Sync>,
    tx: oneshot::Sender<TopicMessage>,
}

impl SubscriptionState {
    fn dispatch(&self, message: &TopicMessage) {
        for handler in self.handlers.lock().iter() {
            handler(message);
        }
        let mut waiters = self.waiters.lock();
        waiters.retain(|w| !w.tx.is_closed());
        // A non-matching message must not consume any waiter.
        if let Some(matched) = waiters.iter().position(|w| (w.predicate)(message)) {
            let waiter = waiters.swap_remove(matched);
            let _ = waiter.tx.send(message.clone());
        }
    }
}

impl TopicSubscription {
    /// Start pumping the given transport stream. The pump ends when the
    /// stream does, or when the subscription is closed or dropped.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = TopicMessage> + Send + 'static,
    {
        let state = Arc::new(SubscriptionState::default());
        let pump_state = state.clone();
        let pump = tokio::spawn(async move {
            futures::pin_mut!(stream);
            while let Some(message) = stream.next().await {
                pump_state.dispatch(&message);
            }
        });
        Self { state, pump }
    }

    /// Register a persistent handler, called for every inbound message.
    pub fn on_message(&self, handler: impl Fn(&TopicMessage) + Send + Sync + 'static) {
        self.state.handlers.lock().push(Box::new(handler));
    }

    /// Arm a one-shot filter. The returned wait resolves with the first
    /// inbound message matching `predicate`; messages failing the predicate
    /// pass it by untouched. Arming is synchronous so the caller can arm
    /// under a lock and await the result outside it.
    pub fn wait_one(
        &self,
        predicate: impl Fn(&TopicMessage) -> bool + Send + Sync + 'static,
    ) -> MessageWait {
        let (tx, rx) = oneshot::channel();
        self.state.waiters.lock().push(Waiter {
            predicate: Box::new(predicate),
            tx,
        });
        MessageWait { rx }
    }

    pub fn close(&self) {
        self.pump.abort();
    }
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// An armed one-shot filter, detached from the subscription's lifetime.
pub struct MessageWait {
    rx: oneshot::Receiver<TopicMessage>,
}

impl MessageWait {
    /// Wait up to `timeout` for the matching message. `None` on timeout or
    /// if the subscription went away.
    pub async fn recv(self, timeout: Duration) -> Option<TopicMessage> {
        tokio::time::timeout(timeout, self.rx)
            .await
            .ok()
            .and_then(|r| r.ok())
    }
}
