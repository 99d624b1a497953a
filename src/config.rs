//! Backbone configuration as the detection framework passes it in.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::model::efficientnet::{EfficientNet, PretrainedOptions};
use crate::model::features::FeatureLevel;
use crate::model::weights::load_weights;
use crate::scaling::GlobalParamsOverrides;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackboneConfig {
    pub name: String,
    pub out_features: Vec<FeatureLevel>,
    pub num_classes: usize,
    pub in_channels: usize,
    /// Nominal stage before which everything is frozen, 0 trains the whole model.
    pub freeze_at: usize,
    /// ImageNet weights applied while building.
    pub pretrained: Option<PathBuf>,
    /// Full backbone weights applied after building, e.g. from a deploy checkpoint.
    pub weights: Option<PathBuf>,
    /// Prepended to every variable name when reading `weights`, `model.` for
    /// deploy checkpoints.
    pub weights_prefix: String,
    pub overrides: Option<GlobalParamsOverrides>,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        BackboneConfig {
            name: "efficientnet-b0".to_string(),
            out_features: vec![FeatureLevel::Res(5)],
            num_classes: 1000,
            in_channels: 3,
            freeze_at: 0,
            pretrained: None,
            weights: None,
            weights_prefix: String::new(),
            overrides: None,
        }
    }
}

impl BackboneConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

/// Builds, freezes and optionally loads a backbone as described by `config`.
pub fn build_backbone(
    config: &BackboneConfig,
    varmap: &VarMap,
    dtype: DType,
    device: &Device,
) -> Result<EfficientNet> {
    let options = PretrainedOptions {
        weights: config.pretrained.clone(),
        num_classes: config.num_classes,
        in_channels: config.in_channels,
        out_features: Some(config.out_features.clone()),
        overrides: config.overrides.clone(),
    };
    let mut model = EfficientNet::from_pretrained(&config.name, &options, varmap, dtype, device)?;
    model.freeze(config.freeze_at)?;

    if let Some(weights) = &config.weights {
        load_weights(varmap, weights, &config.weights_prefix, |_| false)?;
    }

    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_keys() {
        let config: BackboneConfig =
            serde_json::from_str(r#"{"name": "efficientnet-b2", "out_features": ["res3", "res4", "res5"]}"#)
                .unwrap();
        assert_eq!(config.name, "efficientnet-b2");
        assert_eq!(
            config.out_features,
            vec![FeatureLevel::Res(3), FeatureLevel::Res(4), FeatureLevel::Res(5)]
        );
        assert_eq!(config.num_classes, 1000);
        assert_eq!(config.freeze_at, 0);
        assert!(config.pretrained.is_none());
    }

    #[test]
    fn unknown_keys_and_levels_are_rejected() {
        assert!(serde_json::from_str::<BackboneConfig>(r#"{"nmae": "efficientnet-b0"}"#).is_err());
        assert!(serde_json::from_str::<BackboneConfig>(r#"{"out_features": ["p3"]}"#).is_err());
    }

    #[test]
    fn builds_frozen_backbone() {
        let config = BackboneConfig {
            num_classes: 80,
            freeze_at: 2,
            overrides: Some(GlobalParamsOverrides {
                width_coefficient: Some(0.25),
                depth_coefficient: Some(0.5),
                num_classes: Some(3),
                ..Default::default()
            }),
            ..Default::default()
        };
        let varmap = VarMap::new();
        let model = build_backbone(&config, &varmap, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.global_params().num_classes, 80);
        assert!(model.is_frozen("stem.0.weight"));
        assert!(model.is_frozen("_blocks.0._depthwise_conv.weight"));
        let first_trainable = model.stage_start(2).unwrap();
        assert!(!model.is_frozen(&format!("_blocks.{first_trainable}._project_conv.weight")));
        assert!(!model.is_frozen("_fc.weight"));
    }

    #[test]
    fn unknown_variant_fails_to_build() {
        let config = BackboneConfig {
            name: "efficientnet-l2".to_string(),
            ..Default::default()
        };
        let varmap = VarMap::new();
        let err = build_backbone(&config, &varmap, DType::F32, &Device::Cpu).unwrap_err();
        assert!(err.to_string().contains("efficientnet-l2"));
    }
}
