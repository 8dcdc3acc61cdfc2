//! Self-modifying context model.
//!
//! Per agent the model holds fixed-shape parameters
//!
//!   projection  K × D  (row-major, identity at init)
//!   readout     K      (zeros at init)
//!   bias        scalar (zero at init)
//!
//! and a bounded FIFO memory of recent (key, surprise) pairs.
//!
//!   features          = projection · x
//!   expected_accuracy = sigmoid(readout · features + bias)
//!
//! `update` takes one online gradient step on the log-loss of
//! expected_accuracy, where `observed_error` is the surprise
//! `expected − actual`. The step is computed on scratch buffers and only
//! committed if every input and every new parameter is finite, so a
//! rejected update leaves the model byte-for-byte unchanged.
//!
//! Updates are read-modify-write; the gate serializes them per agent
//! through `AgentLocks`.

use crate::{
    config::ContextModelConfig,
    error::{GateError, GateResult},
    types::AgentName,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x1000_0000_01b3;

fn fnv1a(s: &str) -> u64 {
    s.bytes().fold(FNV_OFFSET_BASIS, |h, b| {
        (h ^ b as u64).wrapping_mul(FNV_PRIME)
    })
}

/// One model input: the memory key plus a fixed-dimension value vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextInput {
    pub key:    String,
    pub values: Vec<f64>,
}

/// Encode an assessment as a `dim`-length input vector:
///   [confidence, 1 - confidence, one-hot(class) ..., one-hot(stratum) ...]
/// Class and stratum slots are chosen by FNV-1a hash, so the encoding is
/// deterministic across processes.
pub fn encode_input(stratum: &str, predicted_class: &str, confidence: f64, dim: usize) -> ContextInput {
    let mut values = vec![0.0; dim];
    if dim >= 4 {
        values[0] = confidence;
        values[1] = 1.0 - confidence;
        let slots = dim - 2;
        let class_slots = slots / 2;
        let stratum_slots = slots - class_slots;
        values[2 + (fnv1a(predicted_class) % class_slots as u64) as usize] = 1.0;
        values[2 + class_slots + (fnv1a(stratum) % stratum_slots as u64) as usize] = 1.0;
    }
    ContextInput {
        key: stratum.to_string(),
        values,
    }
}

/// Fixed-capacity FIFO of recent (key, value) pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMemory {
    capacity: usize,
    entries:  VecDeque<(String, f64)>,
}

impl ContextMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Append, evicting the oldest entry when full.
    pub fn push(&mut self, key: String, value: f64) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((key, value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &(String, f64)> {
        self.entries.iter()
    }

    /// Mean absolute surprise over the window.
    pub fn mean_abs_value(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        self.entries.iter().map(|(_, v)| v.abs()).sum::<f64>() / self.entries.len() as f64
    }

    pub(crate) fn from_entries(capacity: usize, entries: Vec<(String, f64)>) -> Self {
        let mut mem = Self::new(capacity);
        for (k, v) in entries {
            mem.push(k, v);
        }
        mem
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextModel {
    pub(crate) agent:        AgentName,
    pub(crate) input_dim:    usize,
    pub(crate) feature_dim:  usize,
    pub(crate) projection:   Vec<f64>,
    pub(crate) readout:      Vec<f64>,
    pub(crate) bias:         f64,
    pub(crate) update_count: u64,
    pub(crate) memory:       ContextMemory,
}

impl ContextModel {
    /// Neutral configuration: identity projection, zero readout, empty memory.
    pub fn neutral(agent: &str, config: &ContextModelConfig) -> Self {
        let (k, d) = (config.feature_dim, config.input_dim);
        let mut projection = vec![0.0; k * d];
        for i in 0..k.min(d) {
            projection[i * d + i] = 1.0;
        }
        Self {
            agent: agent.to_string(),
            input_dim: d,
            feature_dim: k,
            projection,
            readout: vec![0.0; k],
            bias: 0.0,
            update_count: 0,
            memory: ContextMemory::new(config.memory_capacity),
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    pub fn memory(&self) -> &ContextMemory {
        &self.memory
    }

    pub fn projection(&self) -> &[f64] {
        &self.projection
    }

    pub fn readout(&self) -> &[f64] {
        &self.readout
    }

    pub fn bias(&self) -> f64 {
        self.bias
    }

    /// All parameters flattened: projection, readout, bias.
    pub fn parameter_vector(&self) -> Vec<f64> {
        let mut v = Vec::with_capacity(self.projection.len() + self.readout.len() + 1);
        v.extend_from_slice(&self.projection);
        v.extend_from_slice(&self.readout);
        v.push(self.bias);
        v
    }

    fn check_shape(&self, input: &ContextInput) -> GateResult<()> {
        if input.values.len() != self.input_dim {
            return Err(GateError::Shape(format!(
                "agent {}: expected {} input values, got {}",
                self.agent,
                self.input_dim,
                input.values.len()
            )));
        }
        if let Some(i) = input.values.iter().position(|v| !v.is_finite()) {
            return Err(GateError::Shape(format!(
                "agent {}: input value {i} is not finite",
                self.agent
            )));
        }
        Ok(())
    }

    fn project(&self, x: &[f64]) -> Vec<f64> {
        let d = self.input_dim;
        (0..self.feature_dim)
            .map(|i| {
                self.projection[i * d..(i + 1) * d]
                    .iter()
                    .zip(x)
                    .map(|(w, xj)| w * xj)
                    .sum()
            })
            .collect()
    }

    /// Feature vector for `input`. Deterministic given the parameters.
    pub fn extract_features(&self, input: &ContextInput) -> GateResult<Vec<f64>> {
        self.check_shape(input)?;
        Ok(self.project(&input.values))
    }

    /// Probability that the external model's prediction is correct.
    pub fn expected_accuracy(&self, input: &ContextInput) -> GateResult<f64> {
        let f = self.extract_features(input)?;
        let logit: f64 = f.iter().zip(&self.readout).map(|(a, b)| a * b).sum::<f64>() + self.bias;
        Ok(sigmoid(logit))
    }

    /// One online gradient step against `observed_error`, then record
    /// `(input.key, observed_error)` in memory. All-or-nothing.
    pub fn update(
        &mut self,
        input: &ContextInput,
        observed_error: f64,
        learning_rate: f64,
    ) -> GateResult<()> {
        self.check_shape(input)?;
        if !observed_error.is_finite() {
            return Err(GateError::Shape(format!(
                "agent {}: observed error is not finite",
                self.agent
            )));
        }

        let x = &input.values;
        let d = self.input_dim;
        let features = self.project(x);
        let step = learning_rate * observed_error;

        // d(loss)/d(logit) = observed_error for the logistic readout.
        let mut readout = self.readout.clone();
        let mut projection = self.projection.clone();
        for i in 0..self.feature_dim {
            readout[i] -= step * features[i];
            let back = step * self.readout[i];
            for j in 0..d {
                projection[i * d + j] -= back * x[j];
            }
        }
        let bias = self.bias - step;

        if !(bias.is_finite()
            && readout.iter().all(|v| v.is_finite())
            && projection.iter().all(|v| v.is_finite()))
        {
            return Err(GateError::Shape(format!(
                "agent {}: update diverged, parameters left unchanged",
                self.agent
            )));
        }

        self.readout = readout;
        self.projection = projection;
        self.bias = bias;
        self.update_count += 1;
        self.memory.push(input.key.clone(), observed_error);
        Ok(())
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Euclidean distance between two parameter vectors of equal length.
/// Mismatched shapes (a reconfigured agent) count the extra tail as drift.
pub fn parameter_drift(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().max(b.len());
    (0..n)
        .map(|i| {
            let d = a.get(i).copied().unwrap_or(0.0) - b.get(i).copied().unwrap_or(0.0);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// One writer per agent. Cloned handles share the same lock table.
#[derive(Debug, Clone, Default)]
pub struct AgentLocks {
    locks: Arc<DashMap<AgentName, Arc<Mutex<()>>>>,
}

impl AgentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding `agent`'s context state. Hold it across
    /// load → update → save.
    pub fn handle(&self, agent: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(agent.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
