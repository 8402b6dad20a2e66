use std::time::Duration;

use errors::ErrorMetadata;
use ipfs::{
    Index,
    MachineId,
    TopicSubscription,
};
use lang::{
    LangError,
    State,
    Value,
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;
use tokio::time::Instant;

use crate::knobs::HIGH_FREQ_WINDOW;

/// This daemon's posture toward a machine: a Writer may append to the log,
/// a Reader only observes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Reader,
    Writer,
}

/// One applied input and the value it evaluated to.
#[derive(Clone, Debug, PartialEq)]
pub struct EvalPair {
    pub input: Value,
    pub result: Value,
}

/// Refresh posture of a reader machine. A burst of fresh inputs opens a
/// high-frequency window during which the subscription is trusted and the
/// poller stays away; once the window runs dry the machine decays to
/// low-frequency polling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollingState {
    HighFreq { remaining: Duration },
    LowFreq,
}

/// The in-memory cache of one machine: the folded evaluator state, the
/// evaluation history behind it, and the replication bookkeeping.
///
/// `history.len()` always equals the number of inputs folded into `state`,
/// and `last_index` is `None` exactly when the history is empty.
pub struct Machine {
    pub id: MachineId,
    pub state: State,
    pub history: Vec<EvalPair>,
    pub last_index: Option<Index>,
    pub role: Role,
    pub subscription: TopicSubscription,
    pub last_updated: Instant,
    pub polling: PollingState,
}

/// A fully evaluated batch that has not been committed to a machine yet.
/// Splitting evaluation from commit lets the writer sequence the storage
/// append between the two, aborting with the machine untouched on failure.
pub struct Advance {
    state: State,
    pairs: Vec<EvalPair>,
}

impl Advance {
    pub fn results(&self) -> Vec<Value> {
        self.pairs.iter().map(|pair| pair.result.clone()).collect()
    }
}

impl Machine {
    /// An empty machine: initial state, nothing folded, fresh burst window.
    pub fn new(id: MachineId, role: Role, subscription: TopicSubscription) -> Self {
        Self {
            id,
            state: State::new(),
            history: Vec::new(),
            last_index: None,
            role,
            subscription,
            last_updated: Instant::now(),
            polling: PollingState::HighFreq {
                remaining: *HIGH_FREQ_WINDOW,
            },
        }
    }

    /// Fold a batch of inputs over the current state without committing.
    pub fn prepare_advance(&self, inputs: &[Value]) -> anyhow::Result<Advance> {
        let mut state = self.state.clone();
        let mut pairs = Vec::with_capacity(inputs.len());
        for input in inputs {
            let (next, result) = state.apply(input).map_err(invalid_input)?;
            state = next;
            pairs.push(EvalPair {
                input: input.clone(),
                result,
            });
        }
        Ok(Advance { state, pairs })
    }

    pub fn commit_advance(&mut self, advance: Advance) {
        self.state = advance.state;
        self.history.extend(advance.pairs);
    }

    /// Fold and commit in one step, for paths with nothing to sequence in
    /// between. A failed fold leaves the machine unchanged.
    pub fn advance(&mut self, inputs: &[Value]) -> anyhow::Result<Vec<Value>> {
        let advance = self.prepare_advance(inputs)?;
        let results = advance.results();
        self.commit_advance(advance);
        Ok(results)
    }
}

/// A read-only copy of a machine's replication bookkeeping, for assertions.
#[cfg(any(test, feature = "testing"))]
#[derive(Clone, Debug)]
pub struct MachineSnapshot {
    pub role: Role,
    pub history_len: usize,
    pub last_index: Option<Index>,
    pub polling: PollingState,
}

/// An interpreter rejection, surfaced to clients as their own error.
pub fn invalid_input(err: LangError) -> anyhow::Error {
    anyhow::Error::new(ErrorMetadata::invalid_input("InvalidInput", err.to_string()))
}

/// Decode a batch of wire-form expressions into values.
pub fn decode_inputs(raw: &[JsonValue]) -> anyhow::Result<Vec<Value>> {
    raw.iter()
        .map(|json| Value::from_json(json).map_err(invalid_input))
        .collect()
}
