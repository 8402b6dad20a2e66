use std::sync::Arc;

use ipfs::Ipfs;
use machines::{
    FollowStore,
    Hub,
};

pub mod config;
pub mod http;
pub mod public_api;
pub mod router;

#[cfg(test)]
mod test_helpers;
#[cfg(test)]
mod tests;

use config::LocalConfig;

#[derive(Clone)]
pub struct LocalAppState {
    pub hub: Arc<Hub>,
    poller: Arc<tokio::task::JoinHandle<()>>,
}

/// Wire the daemon together: follow store, hub, startup replay, poller.
/// Fails (fatally, for the caller) on follow-file corruption or a failed
/// initial replay.
pub async fn make_app(config: LocalConfig, ipfs: Arc<dyn Ipfs>) -> anyhow::Result<LocalAppState> {
    let follow_store = FollowStore::new(config.follow_file());
    let hub = Hub::new(ipfs, follow_store);
    hub.restore_followed().await?;
    let poller = machines::poller::start(&hub);
    Ok(LocalAppState {
        hub,
        poller: Arc::new(poller),
    })
}

impl LocalAppState {
    /// Stop the poller, then wait out in-flight machine operations and
    /// close their subscriptions.
    pub async fn shutdown(self) {
        self.poller.abort();
        self.hub.drain().await;
    }
}
