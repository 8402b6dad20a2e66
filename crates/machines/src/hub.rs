use std::sync::{
    Arc,
    Weak,
};

use errors::{
    ErrorCode,
    ErrorMetadata,
};
use futures::FutureExt;
use ipfs::{
    Ipfs,
    MachineId,
    TopicMessage,
    TopicSubscription,
};
use lang::Value;
use rand::Rng;
use serde_json::Value as JsonValue;
use tokio::time::Instant;

use crate::{
    chain::{
        decode_inputs,
        invalid_input,
        Machine,
        PollingState,
        Role,
    },
    follow_store::FollowStore,
    knobs::{
        HIGH_FREQ_WINDOW,
        MACHINE_ACK_TIMEOUT,
        POLLER_LOW_FREQ_INTERVAL,
    },
    registry::Registry,
};

/// The role engine: owns the registry and follow store, drives every
/// machine operation against the storage and pub/sub layer.
///
/// Readers replicate by observing the log and reacting to `new_inputs`
/// broadcasts; writers are the single append point for their machines and
/// acknowledge remote append requests over the same topic.
pub struct Hub {
    registry: Registry,
    follow_store: FollowStore,
    ipfs: Arc<dyn Ipfs>,
    /// Handed to subscription handlers so a live topic never keeps the hub
    /// itself alive.
    self_ref: Weak<Hub>,
}

impl Hub {
    pub fn new(ipfs: Arc<dyn Ipfs>, follow_store: FollowStore) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            registry: Registry::new(),
            follow_store,
            ipfs,
            self_ref: self_ref.clone(),
        })
    }

    pub fn role(&self, id: &MachineId) -> Option<Role> {
        self.registry.role(id)
    }

    pub fn followed(&self) -> Vec<(MachineId, Role)> {
        self.registry.entries()
    }

    /// Startup replay: restore every machine in the follow file in its
    /// persisted role. Any failure here is fatal to the boot.
    pub async fn restore_followed(&self) -> anyhow::Result<()> {
        let follows = self.follow_store.load().await?;
        for (id, role) in follows {
            self.load_machine(role, &id).await?;
            tracing::info!("Restored machine {id} as {role:?}");
        }
        self.persist_follows().await?;
        Ok(())
    }

    /// Create a fresh machine with this daemon as its writer.
    pub async fn create_machine(&self) -> anyhow::Result<MachineId> {
        let id = self.ipfs.create_machine_id().await?;
        self.load_machine(Role::Writer, &id).await?;
        self.persist_follows().await?;
        tracing::info!("Created machine {id}");
        Ok(id)
    }

    /// Evaluate an expression against the machine's current state, adopting
    /// the machine as a reader first if it isn't followed yet. Queries never
    /// commit state.
    pub async fn query(&self, id: &MachineId, expression: &JsonValue) -> anyhow::Result<JsonValue> {
        let expr = Value::from_json(expression).map_err(invalid_input)?;
        let role = self.ensure_followed(id).await?;
        if role == Role::Reader {
            // Best effort against staleness before answering.
            self.refresh_as_reader(id).await?;
        }
        let slot = self
            .registry
            .lookup(id)
            .ok_or_else(|| ErrorMetadata::machine_not_cached(&id.0))?;
        let state = slot.lock().await.state.clone();
        let result = state.query(&expr).map_err(invalid_input)?;
        Ok(result.to_json())
    }

    /// Append expressions to the machine's log. On a writer this evaluates
    /// and appends directly; on a reader it asks the writer over pub/sub and
    /// waits for the matching acknowledgement.
    pub async fn send(
        &self,
        id: &MachineId,
        expressions: &[JsonValue],
    ) -> anyhow::Result<Vec<JsonValue>> {
        let inputs = decode_inputs(expressions)?;
        let role = self.ensure_followed(id).await?;
        match role {
            Role::Writer => {
                // The append runs in its own task: a client hanging up may
                // abandon the response, but never a storage write already in
                // progress.
                let hub = self
                    .self_ref
                    .upgrade()
                    .ok_or_else(|| ErrorMetadata::internal("The hub is shutting down"))?;
                let task_id = id.clone();
                let task =
                    tokio::spawn(async move { hub.write_inputs(&task_id, inputs, None).await });
                let results = task
                    .await
                    .map_err(|e| ErrorMetadata::internal(format!("Append task died: {e}")))??;
                Ok(results.iter().map(Value::to_json).collect())
            },
            Role::Reader => self.request_remote_append(id, expressions).await,
        }
    }

    /// Look the machine up, lazily adopting it as a reader when unknown.
    async fn ensure_followed(&self, id: &MachineId) -> anyhow::Result<Role> {
        if let Some(role) = self.registry.role(id) {
            return Ok(role);
        }
        match self.load_machine(Role::Reader, id).await {
            Ok(()) => {
                tracing::info!("Following machine {id} as reader");
                self.persist_follows().await?;
            },
            // Two requests can race to adopt the same machine; the loser's
            // load is discarded and the winner's entry is used.
            Err(err) if is_already_cached(&err) => {},
            Err(err) => return Err(err),
        }
        self.registry
            .role(id)
            .ok_or_else(|| ErrorMetadata::machine_not_cached(&id.0).into())
    }

    /// Rewrite the follow file from the registry's current membership.
    async fn persist_follows(&self) -> anyhow::Result<()> {
        let follows: std::collections::BTreeMap<_, _> = self.registry.entries().into_iter().collect();
        self.follow_store.persist(&follows).await
    }

    /// Common load path for both roles: fold the whole log, open the topic,
    /// install the role's handler, and cache the result.
    async fn load_machine(&self, role: Role, id: &MachineId) -> anyhow::Result<()> {
        let (end_index, raw_inputs) = self.ipfs.read_log_from(id, None).await?;
        let inputs = decode_inputs(&raw_inputs)?;
        let subscription = self.ipfs.subscribe(id).await?;
        self.install_handler(role, id, &subscription);
        let mut machine = Machine::new(id.clone(), role, subscription);
        machine.advance(&inputs)?;
        machine.last_index = end_index;
        self.registry.insert_new(id.clone(), machine)
    }

    /// React to topic traffic for one machine. Handlers only classify and
    /// spawn; failures of the spawned work are logged and swallowed so the
    /// subscription itself survives.
    fn install_handler(&self, role: Role, id: &MachineId, subscription: &TopicSubscription) {
        let hub = self.self_ref.clone();
        let id = id.clone();
        match role {
            Role::Reader => subscription.on_message(move |message| {
                if !matches!(message, TopicMessage::NewInputs { .. }) {
                    return;
                }
                let Some(hub) = hub.upgrade() else { return };
                let id = id.clone();
                tokio::spawn(async move {
                    if let Err(err) = hub.refresh_as_reader(&id).await {
                        let err = err.context(format!("Refreshing reader {id} after new_inputs"));
                        errors::report_error(&err);
                    }
                });
            }),
            Role::Writer => subscription.on_message(move |message| {
                let TopicMessage::ReqInputs { expressions, nonce } = message else {
                    return;
                };
                let Some(hub) = hub.upgrade() else { return };
                let id = id.clone();
                let expressions = expressions.clone();
                let nonce = nonce.clone();
                tokio::spawn(async move {
                    if let Err(err) = hub.handle_remote_append(&id, &expressions, nonce).await {
                        let err = err.context(format!("Handling remote append for {id}"));
                        errors::report_error(&err);
                    }
                });
            }),
        }
    }

    async fn handle_remote_append(
        &self,
        id: &MachineId,
        expressions: &[JsonValue],
        nonce: String,
    ) -> anyhow::Result<()> {
        let inputs = decode_inputs(expressions)?;
        self.write_inputs(id, inputs, Some(nonce)).await?;
        Ok(())
    }

    /// The writer path: evaluate, append to storage, broadcast, commit - in
    /// that order. A storage failure aborts with no local change; a publish
    /// failure does not undo the append (the log is authoritative, readers
    /// catch up through the poller).
    pub async fn write_inputs(
        &self,
        id: &MachineId,
        inputs: Vec<Value>,
        nonce: Option<String>,
    ) -> anyhow::Result<Vec<Value>> {
        let ipfs = self.ipfs.clone();
        self.registry
            .modify(id, |machine: &mut Machine| {
                async move {
                    if machine.role != Role::Writer {
                        return Err(ErrorMetadata::internal(format!(
                            "Machine {} is not writable here",
                            machine.id
                        ))
                        .into());
                    }
                    let advance = machine.prepare_advance(&inputs)?;
                    let results = advance.results();
                    let new_index = if inputs.is_empty() {
                        None
                    } else {
                        let raw: Vec<JsonValue> = inputs.iter().map(Value::to_json).collect();
                        Some(ipfs.write_log(&machine.id, &raw).await?)
                    };
                    let message = TopicMessage::NewInputs {
                        results: results.iter().map(Value::to_json).collect(),
                        nonce,
                    };
                    if let Err(err) = ipfs.publish(&machine.id, &message).await {
                        tracing::warn!(
                            "Couldn't broadcast new inputs for {}: {err:#}",
                            machine.id
                        );
                    }
                    if let Some(index) = new_index {
                        machine.last_index = Some(index);
                    }
                    machine.commit_advance(advance);
                    Ok(results)
                }
                .boxed()
            })
            .await
    }

    /// The reader side of send: a one-shot filter is armed for our nonce
    /// before the request goes out, then awaited outside the entry lock so
    /// refreshes keep flowing while we wait.
    async fn request_remote_append(
        &self,
        id: &MachineId,
        expressions: &[JsonValue],
    ) -> anyhow::Result<Vec<JsonValue>> {
        let nonce: u128 = rand::rng().random();
        let nonce = format!("{nonce:032x}");

        let slot = self
            .registry
            .lookup(id)
            .ok_or_else(|| ErrorMetadata::machine_not_cached(&id.0))?;
        let wait = {
            let machine = slot.lock().await;
            let expected = nonce.clone();
            machine.subscription.wait_one(move |message| {
                matches!(message, TopicMessage::NewInputs { nonce: Some(n), .. } if *n == expected)
            })
        };

        let request = TopicMessage::ReqInputs {
            expressions: expressions.to_vec(),
            nonce,
        };
        self.ipfs.publish(id, &request).await?;

        match wait.recv(*MACHINE_ACK_TIMEOUT).await {
            Some(TopicMessage::NewInputs { results, .. }) => Ok(results),
            Some(_) => {
                Err(ErrorMetadata::internal("A request leaked past the acknowledgement filter")
                    .into())
            },
            None => Err(ErrorMetadata::ack_timeout().into()),
        }
    }

    /// Catch a reader up with storage. Folding fresh inputs re-arms the
    /// high-frequency window; a quiet refresh decays the machine to
    /// low-frequency polling.
    pub async fn refresh_as_reader(&self, id: &MachineId) -> anyhow::Result<()> {
        let ipfs = self.ipfs.clone();
        self.registry
            .modify(id, |machine: &mut Machine| {
                async move {
                    let from = machine.last_index.clone();
                    let (tail, raw) = ipfs.read_log_from(&machine.id, from.as_ref()).await?;
                    let inputs = decode_inputs(&raw)?;
                    machine.advance(&inputs)?;
                    if tail.is_some() {
                        machine.last_index = tail;
                    }
                    machine.polling = if inputs.is_empty() {
                        PollingState::LowFreq
                    } else {
                        PollingState::HighFreq {
                            remaining: *HIGH_FREQ_WINDOW,
                        }
                    };
                    machine.last_updated = Instant::now();
                    Ok(())
                }
                .boxed()
            })
            .await
    }

    /// One poller pass over the reader machines. Writers are skipped; their
    /// cache is authoritative.
    pub async fn poll_tick(&self) {
        for (id, role) in self.registry.entries() {
            if role == Role::Writer {
                continue;
            }
            let Some(slot) = self.registry.lookup(&id) else {
                continue;
            };
            let due = {
                let machine = slot.lock().await;
                let delta = machine.last_updated.elapsed();
                match machine.polling {
                    PollingState::HighFreq { remaining } => delta >= remaining,
                    PollingState::LowFreq => delta >= *POLLER_LOW_FREQ_INTERVAL,
                }
            };
            if !due {
                continue;
            }
            if let Err(err) = self.refresh_as_reader(&id).await {
                let err = err.context(format!("Polling reader {id}"));
                errors::report_error(&err);
            }
        }
    }

    #[cfg(any(test, feature = "testing"))]
    pub async fn testing_snapshot(
        &self,
        id: &MachineId,
    ) -> Option<crate::chain::MachineSnapshot> {
        let slot = self.registry.lookup(id)?;
        let machine = slot.lock().await;
        Some(crate::chain::MachineSnapshot {
            role: machine.role,
            history_len: machine.history.len(),
            last_index: machine.last_index.clone(),
            polling: machine.polling,
        })
    }

    /// Drain for shutdown: waiting on each entry lock lets in-flight
    /// modifies finish before their subscription is closed.
    pub async fn drain(&self) {
        for (id, _) in self.registry.entries() {
            let Some(slot) = self.registry.lookup(&id) else {
                continue;
            };
            let machine = slot.lock().await;
            machine.subscription.close();
        }
        tracing::info!("Hub drained");
    }
}

fn is_already_cached(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ErrorMetadata>()
        .is_some_and(|metadata| metadata.code == ErrorCode::MachineAlreadyCached)
}
