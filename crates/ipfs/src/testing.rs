use std::{
    collections::HashMap,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

use anyhow::Context;
use async_trait::async_trait;
use errors::ErrorMetadata;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;

use crate::{
    message::TopicMessage,
    subscription::TopicSubscription,
    Index,
    Ipfs,
    MachineId,
};

/// An in-process stand-in for the IPFS node: logs in a map, topics over
/// broadcast channels. Cloning shares the underlying "network", so several
/// hubs pointed at clones of one `TestIpfs` behave like daemons on the same
/// swarm. Publishes can be dropped on demand to model the best-effort
/// delivery of the real medium.
#[derive(Clone)]
pub struct TestIpfs {
    inner: Arc<Inner>,
}

struct Inner {
    logs: Mutex<HashMap<MachineId, Vec<JsonValue>>>,
    topics: Mutex<HashMap<MachineId, broadcast::Sender<TopicMessage>>>,
    next_id: AtomicU64,
    drop_publishes: AtomicBool,
}

impl TestIpfs {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                logs: Mutex::new(HashMap::new()),
                topics: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                drop_publishes: AtomicBool::new(false),
            }),
        }
    }

    /// When set, publishes succeed but reach nobody.
    pub fn set_drop_publishes(&self, drop: bool) {
        self.inner.drop_publishes.store(drop, Ordering::SeqCst);
    }

    pub fn log_len(&self, id: &MachineId) -> usize {
        self.inner.logs.lock().get(id).map_or(0, Vec::len)
    }

    fn topic_sender(&self, id: &MachineId) -> broadcast::Sender<TopicMessage> {
        self.inner
            .topics
            .lock()
            .entry(id.clone())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

impl Default for TestIpfs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ipfs for TestIpfs {
    async fn create_machine_id(&self) -> anyhow::Result<MachineId> {
        let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(MachineId(format!("test-machine-{n}")))
    }

    async fn write_log(&self, id: &MachineId, inputs: &[JsonValue]) -> anyhow::Result<Index> {
        let mut logs = self.inner.logs.lock();
        let log = logs.entry(id.clone()).or_default();
        log.extend(inputs.iter().cloned());
        Ok(Index(log.len().to_string()))
    }

    async fn read_log_from(
        &self,
        id: &MachineId,
        from_exclusive: Option<&Index>,
    ) -> anyhow::Result<(Option<Index>, Vec<JsonValue>)> {
        let logs = self.inner.logs.lock();
        let log = logs.get(id).map(Vec::as_slice).unwrap_or_default();
        let start = match from_exclusive {
            None => 0,
            Some(index) => index
                .0
                .parse::<usize>()
                .with_context(|| ErrorMetadata::ipfs_error(format!("bad index {index}")))?,
        };
        let start = start.min(log.len());
        let tail = (!log.is_empty()).then(|| Index(log.len().to_string()));
        Ok((tail, log[start..].to_vec()))
    }

    async fn subscribe(&self, id: &MachineId) -> anyhow::Result<TopicSubscription> {
        let rx = self.topic_sender(id).subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Test topic lagged, skipped {skipped} messages");
                    },
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(TopicSubscription::new(stream))
    }

    async fn publish(&self, id: &MachineId, message: &TopicMessage) -> anyhow::Result<()> {
        if self.inner.drop_publishes.load(Ordering::SeqCst) {
            return Ok(());
        }
        // No subscribers is fine; delivery is best-effort.
        let _ = self.topic_sender(id).send(message.clone());
        Ok(())
    }
}
