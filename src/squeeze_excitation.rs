use crate::adaptive_avg_pool_2d;
use crate::same_padding::{Conv2dSame, Conv2dSameConfig};
use candle_core::{Module, Tensor};

/// Number of channels the gate squeezes to, never less than one.
pub fn squeezed_channels(input_filters: usize, se_ratio: f64) -> usize {
    usize::max(1, (input_filters as f64 * se_ratio) as usize)
}

#[derive(Debug)]
pub struct SqueezeExcitation {
    se_reduce: Conv2dSame,
    se_expand: Conv2dSame,
}

impl SqueezeExcitation {
    pub fn new(
        in_channels: usize,
        squeeze_channels: usize,
        vb: candle_nn::VarBuilder,
    ) -> candle_core::Result<Self> {
        let cfg = Conv2dSameConfig {
            ..Default::default()
        };

        // 1x1 convolutions over a 1x1 map never pad, so no image size is needed.
        Ok(SqueezeExcitation {
            se_reduce: Conv2dSame::new(
                in_channels,
                squeeze_channels,
                1,
                cfg,
                None,
                vb.pp("_se_reduce"),
            )?,
            se_expand: Conv2dSame::new(
                squeeze_channels,
                in_channels,
                1,
                cfg,
                None,
                vb.pp("_se_expand"),
            )?,
        })
    }

    /// Per-channel gate in `(0, 1)`, shaped `(batch, channels, 1, 1)`.
    pub fn gate(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = adaptive_avg_pool_2d(xs)?;
        let xs = candle_nn::ops::silu(&self.se_reduce.forward(&xs)?)?;
        candle_nn::ops::sigmoid(&self.se_expand.forward(&xs)?)
    }

    pub fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        xs.broadcast_mul(&self.gate(xs)?)
    }
}
