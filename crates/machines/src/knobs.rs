//! Tunable parameters for the replication core. Override any of these with
//! an environment variable of the same name.

use std::{
    sync::LazyLock,
    time::Duration,
};

use cmd_util::env::env_config;

/// How long a reader waits for the writer's acknowledgement of a remote
/// append before giving up with an ack timeout.
pub static MACHINE_ACK_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("MACHINE_ACK_TIMEOUT_MS", 4000)));

/// How often the poller wakes up to look at reader machines.
pub static POLLER_TICK_INTERVAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("POLLER_TICK_INTERVAL_MS", 1000)));

/// How often a quiet (low-frequency) reader is refreshed from storage.
pub static POLLER_LOW_FREQ_INTERVAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("POLLER_LOW_FREQ_INTERVAL_MS", 10_000)));

/// The burst window after fresh inputs during which a reader trusts its
/// subscription and the poller leaves it alone.
pub static HIGH_FREQ_WINDOW: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("HIGH_FREQ_WINDOW_MS", 10_000)));
