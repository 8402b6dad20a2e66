use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::PathBuf,
};

use anyhow::Context;
use ipfs::MachineId;

use crate::chain::Role;

/// The minimal durable local state: which machines this daemon follows, and
/// in which role. A JSON object mapping machine id to `"Reader"` or
/// `"Writer"`, rewritten in full on every membership change.
pub struct FollowStore {
    path: PathBuf,
    /// Serialises load against persist; never held during registry work.
    io_lock: tokio::sync::Mutex<()>,
}

impl FollowStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            io_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Read the follow set. An absent file is created holding the empty
    /// map; an undecodable file is an error the caller treats as fatal.
    pub async fn load(&self) -> anyhow::Result<BTreeMap<MachineId, Role>> {
        let _guard = self.io_lock.lock().await;
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).with_context(|| {
                format!(
                    "Follow file {} is corrupt; repair or remove it before restarting",
                    self.path.display()
                )
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let empty = BTreeMap::new();
                self.write_atomically(&empty).await?;
                Ok(empty)
            },
            Err(err) => Err(err)
                .with_context(|| format!("Couldn't read follow file {}", self.path.display())),
        }
    }

    pub async fn persist(&self, follows: &BTreeMap<MachineId, Role>) -> anyhow::Result<()> {
        let _guard = self.io_lock.lock().await;
        self.write_atomically(follows).await
    }

    /// Write-then-rename so a crash leaves either the old or the new file.
    async fn write_atomically(&self, follows: &BTreeMap<MachineId, Role>) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(follows)?;
        let staging = self.path.with_extension("tmp");
        tokio::fs::write(&staging, &json)
            .await
            .with_context(|| format!("Couldn't stage follow file {}", staging.display()))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .with_context(|| format!("Couldn't replace follow file {}", self.path.display()))?;
        Ok(())
    }
}
