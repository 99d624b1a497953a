use std::path::Path;

use candle_nn::VarMap;

use crate::{BackboneError, Result};

/// Copies tensors from a safetensors file into the variables of `varmap`,
/// looking each variable up as `prefix` followed by its full name. Variables
/// for which `skip` returns true keep their current values. Returns the
/// number of variables set.
pub fn load_weights<P: AsRef<Path>>(
    varmap: &VarMap,
    weights_path: P,
    prefix: &str,
    skip: impl Fn(&str) -> bool,
) -> Result<usize> {
    let weights_path = weights_path.as_ref();
    let tensors = unsafe { candle_core::safetensors::MmapedSafetensors::new(weights_path)? };
    let data = varmap
        .data()
        .lock()
        .map_err(|_| BackboneError::Msg("var map lock poisoned".to_string()))?;

    let mut loaded = 0;
    for (name, var) in data.iter() {
        if skip(name) {
            tracing::debug!(%name, "keeping initial value");
            continue;
        }
        let tensor = tensors
            .load(&format!("{prefix}{name}"), var.device())?
            .to_dtype(var.dtype())?;
        var.set(&tensor).map_err(|err| {
            BackboneError::Msg(format!(
                "error setting {name} using data from {weights_path:?}: {err}"
            ))
        })?;
        loaded += 1;
    }
    tracing::info!(path = ?weights_path, loaded, "loaded weights");

    Ok(loaded)
}
