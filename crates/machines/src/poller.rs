use std::sync::Arc;

use tokio::time::MissedTickBehavior;

use crate::{
    hub::Hub,
    knobs::POLLER_TICK_INTERVAL,
};

/// Periodic refresh fallback for reader machines whose subscription may have
/// missed events. A single cooperative task; per-machine work is bounded by
/// the registry's entry locks. Holds the hub weakly and winds down with it.
pub fn start(hub: &Arc<Hub>) -> tokio::task::JoinHandle<()> {
    let hub = Arc::downgrade(hub);
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(*POLLER_TICK_INTERVAL);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            let Some(hub) = hub.upgrade() else {
                break;
            };
            hub.poll_tick().await;
        }
        tracing::info!("Poller stopped");
    })
}
