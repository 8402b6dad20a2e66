use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    sync::Arc,
};

use errors::ErrorMetadata;
use futures::future::BoxFuture;
use ipfs::MachineId;
use parking_lot::Mutex;

use crate::chain::{
    Machine,
    Role,
};

/// Concurrent map from machine id to its cached state.
///
/// The outer lock only locates or inserts the per-entry slot and is never
/// held across an await; all real work runs under the entry's own async
/// mutex. Operations on different ids proceed in parallel, operations on the
/// same id serialise. A machine's role is fixed at insertion, so the
/// follow-set projection never needs the entry locks.
pub struct Registry {
    entries: Mutex<HashMap<MachineId, Entry>>,
}

#[derive(Clone)]
struct Entry {
    role: Role,
    slot: Arc<tokio::sync::Mutex<Machine>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn role(&self, id: &MachineId) -> Option<Role> {
        self.entries.lock().get(id).map(|entry| entry.role)
    }

    pub fn lookup(&self, id: &MachineId) -> Option<Arc<tokio::sync::Mutex<Machine>>> {
        self.entries.lock().get(id).map(|entry| entry.slot.clone())
    }

    pub fn insert_new(&self, id: MachineId, machine: Machine) -> anyhow::Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return Err(ErrorMetadata::machine_already_cached(&id.0).into());
        }
        let entry = Entry {
            role: machine.role,
            slot: Arc::new(tokio::sync::Mutex::new(machine)),
        };
        entries.insert(id, entry);
        Ok(())
    }

    /// Run a fallible action while holding the entry's write lock. The
    /// action may perform I/O; by contract it computes all effects before
    /// mutating the machine, so an `Err` leaves the entry unmodified.
    pub async fn modify<R, F>(&self, id: &MachineId, f: F) -> anyhow::Result<R>
    where
        F: for<'a> FnOnce(&'a mut Machine) -> BoxFuture<'a, anyhow::Result<R>>,
    {
        let slot = self
            .lookup(id)
            .ok_or_else(|| ErrorMetadata::machine_not_cached(&id.0))?;
        let mut machine = slot.lock().await;
        f(&mut machine).await
    }

    /// A consistent key snapshot; values read afterwards may be newer.
    pub fn entries(&self) -> Vec<(MachineId, Role)> {
        self.entries
            .lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.role))
            .collect()
    }

    /// The `(id, role)` projection the follow store persists.
    pub fn projection(&self) -> BTreeMap<MachineId, Role> {
        self.entries().into_iter().collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
