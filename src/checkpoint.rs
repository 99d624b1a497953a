//! Training checkpoints stored as a single safetensors file.
//!
//! Tensor names are `<key>.<name>`, or just `<key>` for scalars such as the
//! iteration counter, so the top-level keys of a checkpoint are the distinct
//! prefixes up to the first dot.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use candle_core::{Device, Tensor};

use crate::{BackboneError, Result};

pub const MODEL_KEY: &str = "model";
pub const OPTIMIZER_KEY: &str = "optimizer";
pub const SCHEDULER_KEY: &str = "scheduler";
pub const ITERATION_KEY: &str = "iteration";

/// Keys a deploy checkpoint leaves out.
pub const TRAINING_STATE_KEYS: [&str; 3] = [OPTIMIZER_KEY, SCHEDULER_KEY, ITERATION_KEY];

fn top_level_key(name: &str) -> &str {
    name.split_once('.').map_or(name, |(key, _)| key)
}

#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    tensors: HashMap<String, Tensor>,
}

impl Checkpoint {
    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Self {
        Checkpoint { tensors }
    }

    /// Assembles a training checkpoint from its parts.
    pub fn training(
        model: HashMap<String, Tensor>,
        optimizer: HashMap<String, Tensor>,
        scheduler: HashMap<String, Tensor>,
        iteration: u32,
        device: &Device,
    ) -> Result<Self> {
        let mut checkpoint = Checkpoint::default();
        checkpoint.insert_section(MODEL_KEY, model);
        checkpoint.insert_section(OPTIMIZER_KEY, optimizer);
        checkpoint.insert_section(SCHEDULER_KEY, scheduler);
        checkpoint
            .tensors
            .insert(ITERATION_KEY.to_string(), Tensor::new(iteration, device)?);
        Ok(checkpoint)
    }

    fn insert_section(&mut self, key: &str, tensors: HashMap<String, Tensor>) {
        for (name, tensor) in tensors {
            self.tensors.insert(format!("{key}.{name}"), tensor);
        }
    }

    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path.as_ref(), device)?;
        tracing::debug!(path = ?path.as_ref(), tensors = tensors.len(), "loaded checkpoint");
        Ok(Checkpoint { tensors })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        candle_core::safetensors::save(&self.tensors, path.as_ref())?;
        Ok(())
    }

    pub fn keys(&self) -> BTreeSet<&str> {
        self.tensors.keys().map(|n| top_level_key(n)).collect()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.tensors.keys().any(|n| top_level_key(n) == key)
    }

    /// Tensors stored under `key`, with the key prefix removed.
    pub fn section(&self, key: &str) -> HashMap<&str, &Tensor> {
        self.tensors
            .iter()
            .filter(|(name, _)| top_level_key(name) == key)
            .map(|(name, t)| (name.strip_prefix(key).unwrap_or(name).trim_start_matches('.'), t))
            .collect()
    }

    pub fn tensors(&self) -> &HashMap<String, Tensor> {
        &self.tensors
    }

    pub fn iteration(&self) -> Result<Option<u32>> {
        match self.tensors.get(ITERATION_KEY) {
            Some(t) => Ok(Some(t.to_dtype(candle_core::DType::U32)?.to_scalar::<u32>()?)),
            None => Ok(None),
        }
    }

    /// Drops the optimizer, scheduler and iteration state, keeping the model
    /// weights. Fails without modifying the checkpoint if any of those keys
    /// is missing.
    pub fn strip_training_state(&mut self) -> Result<()> {
        if let Some(missing) = TRAINING_STATE_KEYS
            .iter()
            .find(|key| !self.contains_key(key))
        {
            return Err(BackboneError::MissingCheckpointKey(missing.to_string()));
        }
        let before = self.tensors.len();
        self.tensors
            .retain(|name, _| !TRAINING_STATE_KEYS.contains(&top_level_key(name)));
        tracing::info!(
            removed = before - self.tensors.len(),
            kept = self.tensors.len(),
            "stripped training state"
        );
        Ok(())
    }
}

/// Reads a training checkpoint from `input` and writes its deployable part
/// to `output`.
pub fn strip_checkpoint_file<P: AsRef<Path>, Q: AsRef<Path>>(input: P, output: Q) -> Result<()> {
    let mut checkpoint = Checkpoint::load(input, &Device::Cpu)?;
    checkpoint.strip_training_state()?;
    checkpoint.save(output)
}
