use std::collections::BTreeMap;
use std::path::PathBuf;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{BatchNorm, Dropout, Linear, VarBuilder, VarMap};

use crate::adaptive_avg_pool_2d;
use crate::model::features::{FeatureLevel, FeatureMaps, ShapeSpec, FEATURE_STAGES};
use crate::model::mbconv::{batch_norm, MBConvBlock};
use crate::model::weights::load_weights;
use crate::same_padding::{output_image_size, Conv2dSame, Conv2dSameConfig};
use crate::scaling::{
    get_model_params, round_filters, round_repeats, BlockArgs, GlobalParams,
    GlobalParamsOverrides, Variant,
};
use crate::{BackboneError, Result};

const STEM_FILTERS: usize = 32;
const HEAD_FILTERS: usize = 1280;
const STEM_STRIDE: usize = 2;
const IMAGENET_CLASSES: usize = 1000;

/// Options for [`EfficientNet::from_pretrained`].
#[derive(Debug, Clone)]
pub struct PretrainedOptions {
    /// safetensors file with the converted ImageNet weights, `None` keeps the
    /// random initialization.
    pub weights: Option<PathBuf>,
    pub num_classes: usize,
    pub in_channels: usize,
    pub out_features: Option<Vec<FeatureLevel>>,
    /// Applied on top of the variant defaults; `num_classes` always wins.
    pub overrides: Option<GlobalParamsOverrides>,
}

impl Default for PretrainedOptions {
    fn default() -> Self {
        PretrainedOptions {
            weights: None,
            num_classes: IMAGENET_CLASSES,
            in_channels: 3,
            out_features: None,
            overrides: None,
        }
    }
}

#[derive(Debug)]
pub struct EfficientNet {
    global_params: GlobalParams,
    blocks_args: Vec<BlockArgs>,
    stem_conv: Conv2dSame,
    stem_bn: BatchNorm,
    blocks: Vec<MBConvBlock>,
    conv_head: Conv2dSame,
    bn1: BatchNorm,
    dropout: Dropout,
    fc: Linear,
    out_features: Vec<FeatureLevel>,
    /// First block of every nominal stage.
    stage_starts: Vec<usize>,
    /// Last block of every `res` level.
    feature_indices: BTreeMap<FeatureLevel, usize>,
    feature_shapes: BTreeMap<FeatureLevel, ShapeSpec>,
    /// Leading blocks excluded from training, `None` when nothing is frozen.
    frozen_blocks: Option<usize>,
    span: tracing::Span,
}

impl EfficientNet {
    pub fn new(
        blocks_args: &[BlockArgs],
        global_params: GlobalParams,
        in_channels: usize,
        out_features: Option<Vec<FeatureLevel>>,
        vb: VarBuilder,
    ) -> Result<Self> {
        if blocks_args.is_empty() {
            return Err(BackboneError::InvalidConfiguration(
                "block args must not be empty".to_string(),
            ));
        }
        let deepest = FEATURE_STAGES[FEATURE_STAGES.len() - 1];
        if blocks_args.len() <= deepest {
            return Err(BackboneError::InvalidConfiguration(format!(
                "feature levels need at least {} stages, got {}",
                deepest + 1,
                blocks_args.len()
            )));
        }
        let params = &global_params;
        let no_bias = Conv2dSameConfig {
            bias: false,
            ..Default::default()
        };
        let mut image_size = params.image_size.map(|s| (s, s));

        let stem_filters = round_filters(STEM_FILTERS, params);
        let stem_conv = Conv2dSame::new(
            in_channels,
            stem_filters,
            3,
            Conv2dSameConfig {
                stride: STEM_STRIDE,
                ..no_bias
            },
            image_size,
            vb.pp("stem.0"),
        )?;
        let stem_bn = batch_norm(stem_filters, params, vb.pp("stem.1"))?;
        image_size = downsample(image_size, STEM_STRIDE);

        let vb_blocks = vb.pp("_blocks");
        let mut blocks = vec![];
        let mut stage_starts = vec![];
        let mut stage_ends = vec![];
        let mut last_filters = stem_filters;
        for stage in blocks_args {
            let stage = stage.scaled(params);

            // Only the first block of a stage changes resolution and width.
            stage_starts.push(blocks.len());
            blocks.push(MBConvBlock::new(
                stage,
                params,
                image_size,
                vb_blocks.pp(blocks.len()),
            )?);
            image_size = downsample(image_size, stage.stride);
            let repeated = stage.repeated();
            for _ in 1..stage.num_repeat {
                blocks.push(MBConvBlock::new(
                    repeated,
                    params,
                    image_size,
                    vb_blocks.pp(blocks.len()),
                )?);
            }
            stage_ends.push(blocks.len() - 1);
            last_filters = stage.output_filters;
        }
        debug_assert_eq!(
            blocks.len(),
            blocks_args
                .iter()
                .map(|b| round_repeats(b.num_repeat, params))
                .sum::<usize>()
        );

        let head_filters = round_filters(HEAD_FILTERS, params);
        let conv_head = Conv2dSame::new(
            last_filters,
            head_filters,
            1,
            no_bias,
            image_size,
            vb.pp("_conv_head"),
        )?;
        let bn1 = batch_norm(head_filters, params, vb.pp("_bn1"))?;
        let dropout = Dropout::new(params.dropout_rate as f32);
        let fc = candle_nn::linear(head_filters, params.num_classes, vb.pp("_fc"))?;

        let mut feature_indices = BTreeMap::new();
        let mut feature_shapes = BTreeMap::new();
        feature_shapes.insert(
            FeatureLevel::Stem,
            ShapeSpec {
                channels: stem_filters,
                stride: STEM_STRIDE,
            },
        );
        for (i, &stage) in FEATURE_STAGES.iter().enumerate() {
            let level = FeatureLevel::Res(i as u8 + 1);
            let stride = blocks_args[..=stage]
                .iter()
                .fold(STEM_STRIDE, |acc, b| acc * b.stride);
            feature_indices.insert(level, stage_ends[stage]);
            feature_shapes.insert(
                level,
                ShapeSpec {
                    channels: round_filters(blocks_args[stage].output_filters, params),
                    stride,
                },
            );
        }
        feature_shapes.insert(
            FeatureLevel::Linear,
            ShapeSpec {
                channels: params.num_classes,
                stride: 1,
            },
        );

        let out_features = out_features.unwrap_or_else(|| vec![FeatureLevel::Res(5)]);
        if let Some(level) = out_features
            .iter()
            .find(|l| !feature_shapes.contains_key(*l))
        {
            return Err(BackboneError::InvalidConfiguration(format!(
                "unknown feature level {level}, expected one of stem, res1..res5, linear"
            )));
        }

        tracing::info!(
            blocks = blocks.len(),
            stem_filters,
            head_filters,
            image_size = ?params.image_size,
            out_features = ?out_features,
            "built efficientnet"
        );

        Ok(EfficientNet {
            global_params,
            blocks_args: blocks_args.to_vec(),
            stem_conv,
            stem_bn,
            blocks,
            conv_head,
            bn1,
            dropout,
            fc,
            out_features,
            stage_starts,
            feature_indices,
            feature_shapes,
            frozen_blocks: None,
            span: tracing::span!(tracing::Level::TRACE, "efficientnet"),
        })
    }

    pub fn from_name(
        model_name: &str,
        override_params: Option<&GlobalParamsOverrides>,
        out_features: Option<Vec<FeatureLevel>>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (blocks_args, global_params) = get_model_params(model_name, override_params)?;
        EfficientNet::new(&blocks_args, global_params, 3, out_features, vb)
    }

    /// Builds the model into `varmap`, then loads `options.weights` if any.
    ///
    /// The classifier is only loaded for 1000 classes. With a non RGB input
    /// the stem convolution is sized for `in_channels` and keeps its random
    /// initialization.
    pub fn from_pretrained(
        model_name: &str,
        options: &PretrainedOptions,
        varmap: &VarMap,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let overrides = GlobalParamsOverrides {
            num_classes: Some(options.num_classes),
            ..options.overrides.clone().unwrap_or_default()
        };
        let (blocks_args, global_params) = get_model_params(model_name, Some(&overrides))?;
        let vb = VarBuilder::from_varmap(varmap, dtype, device);
        let model = EfficientNet::new(
            &blocks_args,
            global_params,
            options.in_channels,
            options.out_features.clone(),
            vb,
        )?;

        if let Some(weights) = &options.weights {
            let load_fc = options.num_classes == IMAGENET_CLASSES;
            let load_stem = options.in_channels == 3;
            if !load_stem {
                tracing::warn!(
                    in_channels = options.in_channels,
                    "stem convolution rebuilt, pretrained stem weights are not used"
                );
            }
            load_weights(varmap, weights, "", |name| {
                (!load_fc && name.starts_with("_fc."))
                    || (!load_stem && name == "stem.0.weight")
            })?;
        }

        Ok(model)
    }

    pub fn get_image_size(model_name: &str) -> Result<usize> {
        let variant: Variant = model_name.parse()?;
        Ok(variant.params().resolution)
    }

    pub fn global_params(&self) -> &GlobalParams {
        &self.global_params
    }

    pub fn blocks_args(&self) -> &[BlockArgs] {
        &self.blocks_args
    }

    pub fn blocks(&self) -> &[MBConvBlock] {
        &self.blocks
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn out_features(&self) -> &[FeatureLevel] {
        &self.out_features
    }

    /// Index of the last block of a `res` level.
    pub fn feature_index(&self, level: FeatureLevel) -> Option<usize> {
        self.feature_indices.get(&level).copied()
    }

    pub fn stage_start(&self, stage: usize) -> Option<usize> {
        self.stage_starts.get(stage).copied()
    }

    /// Channels and stride of every requested feature level.
    pub fn output_shape(&self) -> BTreeMap<FeatureLevel, ShapeSpec> {
        self.out_features
            .iter()
            .filter_map(|l| self.feature_shapes.get(l).map(|s| (*l, *s)))
            .collect()
    }

    /// Excludes the stem and every block before the first block of nominal
    /// stage `stage_index` from training. `freeze(0)` does nothing.
    pub fn freeze(&mut self, stage_index: usize) -> Result<()> {
        if stage_index == 0 {
            return Ok(());
        }
        let first_block = self.stage_start(stage_index).ok_or_else(|| {
            BackboneError::InvalidConfiguration(format!(
                "cannot freeze at stage {stage_index}, the model has {} stages",
                self.stage_starts.len()
            ))
        })?;
        tracing::info!(stage_index, frozen_blocks = first_block, "freezing backbone");
        self.frozen_blocks = Some(first_block);
        Ok(())
    }

    /// Whether the variable at `path` (as named in the var map) is frozen.
    pub fn is_frozen(&self, path: &str) -> bool {
        let Some(frozen_blocks) = self.frozen_blocks else {
            return false;
        };
        if path.starts_with("stem.") {
            return true;
        }
        path.strip_prefix("_blocks.")
            .and_then(|rest| rest.split('.').next())
            .and_then(|idx| idx.parse::<usize>().ok())
            .is_some_and(|idx| idx < frozen_blocks)
    }

    /// Variables an optimizer should update: everything but frozen parameters
    /// and batch-norm running statistics.
    pub fn trainable_vars(&self, varmap: &VarMap) -> Result<Vec<Var>> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| BackboneError::Msg("var map lock poisoned".to_string()))?;
        let mut vars: Vec<(&String, &Var)> = data
            .iter()
            .filter(|(name, _)| {
                !self.is_frozen(name)
                    && !name.ends_with(".running_mean")
                    && !name.ends_with(".running_var")
            })
            .collect();
        vars.sort_by(|a, b| a.0.cmp(b.0));
        Ok(vars.into_iter().map(|(_, v)| v.clone()).collect())
    }

    /// Drop-connect rate of block `idx`, rising linearly from 0 for the first
    /// block towards `drop_connect_rate`.
    pub fn drop_connect_rate(&self, idx: usize) -> f64 {
        self.global_params.drop_connect_rate * idx as f64 / self.blocks.len() as f64
    }

    /// Runs every block and returns the head activation along with the
    /// requested intermediate feature maps.
    pub fn extract_features(
        &self,
        xs: &Tensor,
        train: bool,
    ) -> candle_core::Result<(Tensor, FeatureMaps)> {
        let _enter = self.span.enter();
        let mut outputs = FeatureMaps::new();

        let mut xs = candle_nn::ops::silu(&self.stem_conv.forward(xs)?.apply_t(&self.stem_bn, train)?)?;
        if self.frozen_blocks.is_some() {
            xs = xs.detach();
        }
        if self.out_features.contains(&FeatureLevel::Stem) {
            outputs.insert(FeatureLevel::Stem, xs.clone());
        }

        let level_ends: BTreeMap<usize, FeatureLevel> = self
            .feature_indices
            .iter()
            .map(|(level, idx)| (*idx, *level))
            .collect();
        for (idx, block) in self.blocks.iter().enumerate() {
            xs = block.forward(&xs, self.drop_connect_rate(idx), train)?;
            if self.frozen_blocks == Some(idx + 1) {
                xs = xs.detach();
            }
            if let Some(level) = level_ends.get(&idx) {
                if self.out_features.contains(level) {
                    outputs.insert(*level, xs.clone());
                }
            }
        }

        let xs = self.conv_head.forward(&xs)?.apply_t(&self.bn1, train)?;
        let xs = candle_nn::ops::silu(&xs)?;
        Ok((xs, outputs))
    }

    /// Feature extraction followed by the classifier, whose logits are
    /// reported under `linear` when requested.
    pub fn forward(&self, xs: &Tensor, train: bool) -> candle_core::Result<FeatureMaps> {
        let (xs, mut outputs) = self.extract_features(xs, train)?;

        let xs = adaptive_avg_pool_2d(&xs)?.flatten_from(1)?;
        let xs = self.dropout.forward(&xs, train)?;
        let xs = self.fc.forward(&xs)?;
        if self.out_features.contains(&FeatureLevel::Linear) {
            outputs.insert(FeatureLevel::Linear, xs);
        }
        Ok(outputs)
    }
}

fn downsample(image_size: Option<(usize, usize)>, stride: usize) -> Option<(usize, usize)> {
    image_size.map(|(h, w)| (output_image_size(h, stride), output_image_size(w, stride)))
}
