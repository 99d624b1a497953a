use candle_core::{Module, Result, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, VarBuilder};

use crate::same_padding::{output_image_size, Conv2dSame, Conv2dSameConfig};
use crate::scaling::{BlockArgs, GlobalParams};
use crate::squeeze_excitation::{squeezed_channels, SqueezeExcitation};

pub(crate) fn batch_norm(
    num_features: usize,
    params: &GlobalParams,
    vb: VarBuilder,
) -> Result<BatchNorm> {
    let cfg = BatchNormConfig {
        eps: params.batch_norm_epsilon,
        momentum: 1. - params.batch_norm_momentum,
        ..Default::default()
    };
    candle_nn::batch_norm(num_features, cfg, vb)
}

/// Zeroes whole samples with probability `p` while training, scaling the
/// survivors by `1 / (1 - p)`.
pub fn drop_connect(xs: &Tensor, p: f64, train: bool) -> Result<Tensor> {
    if !train || p <= 0. {
        return Ok(xs.clone());
    }
    let keep_prob = 1. - p;
    let batch_size = xs.dim(0)?;
    let mask = Tensor::rand(0f32, 1f32, (batch_size, 1, 1, 1), xs.device())?
        .ge(p)?
        .to_dtype(xs.dtype())?;
    xs.affine(1. / keep_prob, 0.)?.broadcast_mul(&mask)
}

/// Mobile inverted residual bottleneck block.
#[derive(Debug)]
pub struct MBConvBlock {
    args: BlockArgs,
    expand: Option<(Conv2dSame, BatchNorm)>,
    depthwise_conv: Conv2dSame,
    bn1: BatchNorm,
    se: Option<SqueezeExcitation>,
    project_conv: Conv2dSame,
    bn2: BatchNorm,
}

impl MBConvBlock {
    /// `image_size` is the block's input resolution when known ahead of time.
    pub fn new(
        args: BlockArgs,
        params: &GlobalParams,
        image_size: Option<(usize, usize)>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let no_bias = Conv2dSameConfig {
            bias: false,
            ..Default::default()
        };

        let inp = args.input_filters;
        let oup = args.input_filters * args.expand_ratio;
        let expand = if args.expand_ratio != 1 {
            let conv = Conv2dSame::new(inp, oup, 1, no_bias, image_size, vb.pp("_expand_conv"))?;
            Some((conv, batch_norm(oup, params, vb.pp("_bn0"))?))
        } else {
            None
        };

        let depthwise_cfg = Conv2dSameConfig {
            stride: args.stride,
            groups: oup,
            ..no_bias
        };
        let depthwise_conv = Conv2dSame::new(
            oup,
            oup,
            args.kernel_size,
            depthwise_cfg,
            image_size,
            vb.pp("_depthwise_conv"),
        )?;
        let bn1 = batch_norm(oup, params, vb.pp("_bn1"))?;
        let image_size = image_size.map(|(h, w)| {
            (
                output_image_size(h, args.stride),
                output_image_size(w, args.stride),
            )
        });

        let se = match args.se_ratio {
            Some(ratio) if args.has_se() => Some(SqueezeExcitation::new(
                oup,
                squeezed_channels(args.input_filters, ratio),
                vb.clone(),
            )?),
            _ => None,
        };

        let project_conv = Conv2dSame::new(
            oup,
            args.output_filters,
            1,
            no_bias,
            image_size,
            vb.pp("_project_conv"),
        )?;
        let bn2 = batch_norm(args.output_filters, params, vb.pp("_bn2"))?;

        Ok(MBConvBlock {
            args,
            expand,
            depthwise_conv,
            bn1,
            se,
            project_conv,
            bn2,
        })
    }

    pub fn args(&self) -> &BlockArgs {
        &self.args
    }

    pub fn has_se(&self) -> bool {
        self.se.is_some()
    }

    /// Whether the block adds its input back onto the projected output.
    pub fn has_skip(&self) -> bool {
        self.args.id_skip
            && self.args.stride == 1
            && self.args.input_filters == self.args.output_filters
    }

    pub fn forward(&self, inputs: &Tensor, drop_connect_rate: f64, train: bool) -> Result<Tensor> {
        let xs = match &self.expand {
            Some((conv, bn)) => candle_nn::ops::silu(&conv.forward(inputs)?.apply_t(bn, train)?)?,
            None => inputs.clone(),
        };
        let xs = self.depthwise_conv.forward(&xs)?.apply_t(&self.bn1, train)?;
        let xs = candle_nn::ops::silu(&xs)?;

        let xs = match &self.se {
            Some(se) => se.forward(&xs)?,
            None => xs,
        };

        let xs = self.project_conv.forward(&xs)?.apply_t(&self.bn2, train)?;

        if self.has_skip() {
            let xs = drop_connect(&xs, drop_connect_rate, train)?;
            xs + inputs
        } else {
            Ok(xs)
        }
    }
}
