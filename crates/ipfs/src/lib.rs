//! Client boundary for the content-addressed storage and pub/sub layer.
//!
//! Machines live as linked DAG nodes in IPFS: each append produces a node
//! `{ prev, inputs }` whose CID becomes the machine's new head, published
//! under the machine's key. The machine id doubles as the pub/sub topic
//! carrying the append/acknowledge protocol between readers and the writer.
//!
//! The daemon core only sees the [`Ipfs`] trait. `HttpIpfsClient` talks to a
//! real IPFS node over its HTTP API; `TestIpfs` is an in-process network
//! shared between hubs in tests.

mod http_client;
pub mod message;
mod subscription;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::fmt;

use async_trait::async_trait;
pub use http_client::HttpIpfsClient;
pub use message::TopicMessage;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;
pub use subscription::{
    MessageWait,
    TopicSubscription,
};

/// Opaque machine identifier: storage key and pub/sub topic name.
/// Equality is by bytes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(pub String);

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MachineId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque cursor into a machine's log, produced by the storage layer. The
/// core only stores the most recent one and hands it back as the exclusive
/// starting point of the next read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Index(pub String);

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The storage + pub/sub operations the replication core consumes.
///
/// Log reads and writes are authoritative; pub/sub delivery is best-effort,
/// at-most-once, ordered within a topic.
#[async_trait]
pub trait Ipfs: Send + Sync + 'static {
    /// Create a fresh machine id this node can write to.
    async fn create_machine_id(&self) -> anyhow::Result<MachineId>;

    /// Atomically append a batch of inputs, returning the new tail index.
    async fn write_log(&self, id: &MachineId, inputs: &[JsonValue]) -> anyhow::Result<Index>;

    /// Read the inputs strictly after `from_exclusive` (the whole log when
    /// `None`), together with the log's current tail index (`None` iff the
    /// log is empty).
    async fn read_log_from(
        &self,
        id: &MachineId,
        from_exclusive: Option<&Index>,
    ) -> anyhow::Result<(Option<Index>, Vec<JsonValue>)>;

    /// Open a subscription on the machine's topic.
    async fn subscribe(&self, id: &MachineId) -> anyhow::Result<TopicSubscription>;

    /// Broadcast a message on the machine's topic.
    async fn publish(&self, id: &MachineId, message: &TopicMessage) -> anyhow::Result<()>;
}
