//! The replication core: cached machine state, the reader/writer role
//! engine, the poll-based refresh fallback, and the durable follow set.

mod chain;
mod follow_store;
mod hub;
pub mod knobs;
pub mod poller;
mod registry;

#[cfg(test)]
mod tests;

pub use chain::{
    EvalPair,
    Machine,
    PollingState,
    Role,
};
pub use follow_store::FollowStore;
pub use hub::Hub;
pub use registry::Registry;
