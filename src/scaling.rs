//! Width/depth scaling rules and the per-variant parameter tables.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{BackboneError, Result};

/// Parameters shared by every block of a model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlobalParams {
    pub width_coefficient: f64,
    pub depth_coefficient: f64,
    /// Known input resolution. `Some` selects statically padded convolutions.
    pub image_size: Option<usize>,
    /// TensorFlow-style momentum, the runtime uses `1 - batch_norm_momentum`.
    pub batch_norm_momentum: f64,
    pub batch_norm_epsilon: f64,
    pub dropout_rate: f64,
    pub drop_connect_rate: f64,
    pub num_classes: usize,
    pub depth_divisor: usize,
    pub min_depth: Option<usize>,
}

impl GlobalParams {
    pub fn efficientnet(
        width_coefficient: f64,
        depth_coefficient: f64,
        image_size: usize,
        dropout_rate: f64,
    ) -> Self {
        GlobalParams {
            width_coefficient,
            depth_coefficient,
            image_size: Some(image_size),
            batch_norm_momentum: 0.99,
            batch_norm_epsilon: 1e-3,
            dropout_rate,
            drop_connect_rate: 0.2,
            num_classes: 1000,
            depth_divisor: 8,
            min_depth: None,
        }
    }

    pub fn with_overrides(self, overrides: &GlobalParamsOverrides) -> Self {
        GlobalParams {
            width_coefficient: overrides.width_coefficient.unwrap_or(self.width_coefficient),
            depth_coefficient: overrides.depth_coefficient.unwrap_or(self.depth_coefficient),
            image_size: overrides.image_size.unwrap_or(self.image_size),
            batch_norm_momentum: overrides
                .batch_norm_momentum
                .unwrap_or(self.batch_norm_momentum),
            batch_norm_epsilon: overrides
                .batch_norm_epsilon
                .unwrap_or(self.batch_norm_epsilon),
            dropout_rate: overrides.dropout_rate.unwrap_or(self.dropout_rate),
            drop_connect_rate: overrides.drop_connect_rate.unwrap_or(self.drop_connect_rate),
            num_classes: overrides.num_classes.unwrap_or(self.num_classes),
            depth_divisor: overrides.depth_divisor.unwrap_or(self.depth_divisor),
            min_depth: overrides.min_depth.unwrap_or(self.min_depth),
        }
    }
}

/// Field-by-field replacements for [`GlobalParams`].
///
/// `image_size` and `min_depth` are doubly optional so a config can clear them:
/// `"image_size": null` switches the model to dynamically padded convolutions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GlobalParamsOverrides {
    pub width_coefficient: Option<f64>,
    pub depth_coefficient: Option<f64>,
    #[serde(deserialize_with = "double_option")]
    pub image_size: Option<Option<usize>>,
    pub batch_norm_momentum: Option<f64>,
    pub batch_norm_epsilon: Option<f64>,
    pub dropout_rate: Option<f64>,
    pub drop_connect_rate: Option<f64>,
    pub num_classes: Option<usize>,
    pub depth_divisor: Option<usize>,
    #[serde(deserialize_with = "double_option")]
    pub min_depth: Option<Option<usize>>,
}

fn double_option<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// Nominal configuration of one stage of blocks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockArgs {
    pub kernel_size: usize,
    pub num_repeat: usize,
    pub input_filters: usize,
    pub output_filters: usize,
    pub expand_ratio: usize,
    pub id_skip: bool,
    pub stride: usize,
    pub se_ratio: Option<f64>,
}

impl BlockArgs {
    const fn stage(
        num_repeat: usize,
        kernel_size: usize,
        stride: usize,
        expand_ratio: usize,
        input_filters: usize,
        output_filters: usize,
    ) -> Self {
        BlockArgs {
            kernel_size,
            num_repeat,
            input_filters,
            output_filters,
            expand_ratio,
            id_skip: true,
            stride,
            se_ratio: Some(0.25),
        }
    }

    /// Stage args with channel and repeat counts scaled by `params`.
    pub fn scaled(self, params: &GlobalParams) -> Self {
        BlockArgs {
            input_filters: round_filters(self.input_filters, params),
            output_filters: round_filters(self.output_filters, params),
            num_repeat: round_repeats(self.num_repeat, params),
            ..self
        }
    }

    /// Args of the repeated blocks following the first block of a stage.
    pub fn repeated(self) -> Self {
        BlockArgs {
            input_filters: self.output_filters,
            stride: 1,
            ..self
        }
    }

    pub fn has_se(&self) -> bool {
        matches!(self.se_ratio, Some(r) if r > 0. && r <= 1.)
    }
}

/// The EfficientNet-B0 stage layout every variant is scaled from.
pub const EFFICIENTNET_BLOCKS: [BlockArgs; 7] = [
    BlockArgs::stage(1, 3, 1, 1, 32, 16),
    BlockArgs::stage(2, 3, 2, 6, 16, 24),
    BlockArgs::stage(2, 5, 2, 6, 24, 40),
    BlockArgs::stage(3, 3, 2, 6, 40, 80),
    BlockArgs::stage(3, 5, 1, 6, 80, 112),
    BlockArgs::stage(4, 5, 2, 6, 112, 192),
    BlockArgs::stage(1, 3, 1, 6, 192, 320),
];

/// Channel count scaled by the width coefficient, rounded to the depth divisor.
pub fn round_filters(filters: usize, params: &GlobalParams) -> usize {
    let multiplier = params.width_coefficient;
    if multiplier == 0. {
        return filters;
    }
    let divisor = params.depth_divisor.max(1);
    let min_depth = params.min_depth.unwrap_or(divisor);
    let filters = filters as f64 * multiplier;
    let rounded = ((filters + divisor as f64 / 2.) as usize) / divisor * divisor;
    let new_filters = usize::max(min_depth, rounded);
    // rounding down must not lose more than 10%
    if (new_filters as f64) < 0.9 * filters {
        new_filters + divisor
    } else {
        new_filters
    }
}

/// Repeat count scaled by the depth coefficient, rounded up.
pub fn round_repeats(repeats: usize, params: &GlobalParams) -> usize {
    let multiplier = params.depth_coefficient;
    if multiplier == 0. {
        return repeats;
    }
    usize::max(1, (multiplier * repeats as f64).ceil() as usize)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VariantParams {
    pub width_coefficient: f64,
    pub depth_coefficient: f64,
    pub resolution: usize,
    pub dropout_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    B0,
    B1,
    B2,
    B3,
    B4,
    B5,
    B6,
    B7,
    B8,
}

impl Variant {
    pub const ALL: [Variant; 9] = [
        Variant::B0,
        Variant::B1,
        Variant::B2,
        Variant::B3,
        Variant::B4,
        Variant::B5,
        Variant::B6,
        Variant::B7,
        Variant::B8,
    ];

    pub fn params(self) -> VariantParams {
        let (width_coefficient, depth_coefficient, resolution, dropout_rate) = match self {
            Variant::B0 => (1.0, 1.0, 224, 0.2),
            Variant::B1 => (1.0, 1.1, 240, 0.2),
            Variant::B2 => (1.1, 1.2, 260, 0.3),
            Variant::B3 => (1.2, 1.4, 300, 0.3),
            Variant::B4 => (1.4, 1.8, 380, 0.4),
            Variant::B5 => (1.6, 2.2, 456, 0.4),
            Variant::B6 => (1.8, 2.6, 528, 0.5),
            Variant::B7 => (2.0, 3.1, 600, 0.5),
            Variant::B8 => (2.2, 3.6, 672, 0.5),
        };
        VariantParams {
            width_coefficient,
            depth_coefficient,
            resolution,
            dropout_rate,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Variant::B0 => "efficientnet-b0",
            Variant::B1 => "efficientnet-b1",
            Variant::B2 => "efficientnet-b2",
            Variant::B3 => "efficientnet-b3",
            Variant::B4 => "efficientnet-b4",
            Variant::B5 => "efficientnet-b5",
            Variant::B6 => "efficientnet-b6",
            Variant::B7 => "efficientnet-b7",
            Variant::B8 => "efficientnet-b8",
        }
    }

    pub fn global_params(self) -> GlobalParams {
        let p = self.params();
        GlobalParams::efficientnet(
            p.width_coefficient,
            p.depth_coefficient,
            p.resolution,
            p.dropout_rate,
        )
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Variant {
    type Err = BackboneError;

    fn from_str(s: &str) -> Result<Self> {
        Variant::ALL
            .into_iter()
            .find(|v| v.name() == s)
            .ok_or_else(|| BackboneError::InvalidVariant {
                name: s.to_string(),
                valid: Variant::ALL.iter().map(|v| v.name().to_string()).collect(),
            })
    }
}

/// Nominal block args and global params for a named model.
pub fn get_model_params(
    model_name: &str,
    overrides: Option<&GlobalParamsOverrides>,
) -> Result<(Vec<BlockArgs>, GlobalParams)> {
    let variant: Variant = model_name.parse()?;
    let params = variant.global_params();
    let params = match overrides {
        Some(o) => params.with_overrides(o),
        None => params,
    };
    Ok((EFFICIENTNET_BLOCKS.to_vec(), params))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_filters_b0_is_identity_on_multiples_of_eight() {
        let params = Variant::B0.global_params();
        for c in [16, 24, 32, 40, 80, 112, 192, 320, 1280] {
            assert_eq!(round_filters(c, &params), c);
        }
    }

    #[test]
    fn round_filters_scaled_variants() {
        let b2 = Variant::B2.global_params();
        assert_eq!(round_filters(32, &b2), 32);
        assert_eq!(round_filters(320, &b2), 352);
        assert_eq!(round_filters(1280, &b2), 1408);

        let b4 = Variant::B4.global_params();
        assert_eq!(round_filters(32, &b4), 48);
        assert_eq!(round_filters(16, &b4), 24);
        assert_eq!(round_filters(1280, &b4), 1792);

        let b7 = Variant::B7.global_params();
        assert_eq!(round_filters(32, &b7), 64);
        assert_eq!(round_filters(1280, &b7), 2560);
    }

    #[test]
    fn round_filters_never_drops_more_than_ten_percent() {
        for variant in Variant::ALL {
            let params = variant.global_params();
            for base in 1..=1280 {
                let scaled = base as f64 * params.width_coefficient;
                let got = round_filters(base, &params);
                assert!(got > 0 && got % 8 == 0, "{variant} {base} -> {got}");
                assert!(got as f64 >= 0.9 * scaled, "{variant} {base} -> {got}");
                assert_eq!(got, round_filters(base, &params));
            }
        }
    }

    #[test]
    fn round_filters_unset_width_is_passthrough() {
        let params = GlobalParams {
            width_coefficient: 0.,
            ..Variant::B0.global_params()
        };
        assert_eq!(round_filters(13, &params), 13);
    }

    #[test]
    fn round_repeats_ceils() {
        let b0 = Variant::B0.global_params();
        assert_eq!(round_repeats(3, &b0), 3);
        let b1 = Variant::B1.global_params();
        assert_eq!(round_repeats(1, &b1), 2);
        assert_eq!(round_repeats(2, &b1), 3);
        assert_eq!(round_repeats(4, &b1), 5);
        let b7 = Variant::B7.global_params();
        assert_eq!(round_repeats(4, &b7), 13);
        let tiny = GlobalParams {
            depth_coefficient: 0.1,
            ..b0
        };
        assert_eq!(round_repeats(1, &tiny), 1);
    }

    #[test]
    fn variant_names_round_trip() {
        for v in Variant::ALL {
            assert_eq!(v.name().parse::<Variant>().unwrap(), v);
        }
    }

    #[test]
    fn unknown_variant_is_rejected() {
        let err = "efficientnet-b9".parse::<Variant>().unwrap_err();
        match err {
            BackboneError::InvalidVariant { name, valid } => {
                assert_eq!(name, "efficientnet-b9");
                assert_eq!(valid.len(), 9);
                assert_eq!(valid[0], "efficientnet-b0");
                assert_eq!(valid[8], "efficientnet-b8");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let overrides = GlobalParamsOverrides {
            num_classes: Some(80),
            image_size: Some(None),
            ..Default::default()
        };
        let (blocks, params) = get_model_params("efficientnet-b3", Some(&overrides)).unwrap();
        assert_eq!(blocks.len(), 7);
        assert_eq!(params.num_classes, 80);
        assert_eq!(params.image_size, None);
        assert_eq!(params.width_coefficient, 1.2);
        assert_eq!(params.dropout_rate, 0.3);
    }

    #[test]
    fn overrides_from_json() {
        let overrides: GlobalParamsOverrides =
            serde_json::from_str(r#"{"drop_connect_rate": 0.0, "image_size": null}"#).unwrap();
        assert_eq!(overrides.drop_connect_rate, Some(0.0));
        assert_eq!(overrides.image_size, Some(None));
        assert_eq!(overrides.num_classes, None);
    }

    #[test]
    fn scaled_and_repeated_args() {
        let params = Variant::B4.global_params();
        let stage = EFFICIENTNET_BLOCKS[1].scaled(&params);
        assert_eq!(stage.input_filters, 24);
        assert_eq!(stage.output_filters, 32);
        assert_eq!(stage.num_repeat, 4);
        assert_eq!(stage.stride, 2);
        let rest = stage.repeated();
        assert_eq!(rest.input_filters, 32);
        assert_eq!(rest.stride, 1);
        assert_eq!(rest.kernel_size, stage.kernel_size);
    }
}
