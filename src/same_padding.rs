//! Convolutions with TensorFlow-style "same" padding.
//!
//! Pretrained EfficientNet weights were trained with asymmetric padding, the
//! extra row/column going to the bottom/right. Symmetric `Conv2dConfig::padding`
//! cannot express that, so the input is zero padded explicitly before an
//! unpadded convolution.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};

/// Padding `(before, after)` along one spatial axis so that the output has
/// `ceil(input / stride)` elements.
pub fn same_padding(input: usize, kernel: usize, stride: usize, dilation: usize) -> (usize, usize) {
    let out = output_image_size(input, stride);
    let needed = (out.max(1) - 1) * stride + (kernel - 1) * dilation + 1;
    let total = needed.saturating_sub(input);
    (total / 2, total - total / 2)
}

/// Spatial size after a "same" convolution with the given stride.
pub fn output_image_size(input: usize, stride: usize) -> usize {
    input.div_ceil(stride)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamePadding {
    /// Padding derived from the input shape on every call.
    Dynamic,
    /// Padding precomputed for a known input resolution.
    Static {
        top: usize,
        bottom: usize,
        left: usize,
        right: usize,
    },
}

impl SamePadding {
    pub fn for_image_size(
        image_size: Option<(usize, usize)>,
        kernel: usize,
        stride: usize,
        dilation: usize,
    ) -> Self {
        match image_size {
            Some((h, w)) => {
                let (top, bottom) = same_padding(h, kernel, stride, dilation);
                let (left, right) = same_padding(w, kernel, stride, dilation);
                SamePadding::Static {
                    top,
                    bottom,
                    left,
                    right,
                }
            }
            None => SamePadding::Dynamic,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Conv2dSameConfig {
    pub stride: usize,
    pub dilation: usize,
    pub groups: usize,
    pub bias: bool,
}

impl Default for Conv2dSameConfig {
    fn default() -> Self {
        Conv2dSameConfig {
            stride: 1,
            dilation: 1,
            groups: 1,
            bias: true,
        }
    }
}

#[derive(Debug)]
pub struct Conv2dSame {
    conv: Conv2d,
    kernel_size: usize,
    cfg: Conv2dSameConfig,
    padding: SamePadding,
    image_size: Option<(usize, usize)>,
}

impl Conv2dSame {
    /// `image_size` is the input resolution of this layer when known ahead of
    /// time, `None` for dynamically padded convolutions. Inputs of any other
    /// size fall back to dynamic padding.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        cfg: Conv2dSameConfig,
        image_size: Option<(usize, usize)>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 0,
            stride: cfg.stride,
            dilation: cfg.dilation,
            groups: cfg.groups,
            ..Default::default()
        };
        let conv = if cfg.bias {
            candle_nn::conv2d(in_channels, out_channels, kernel_size, conv_cfg, vb)?
        } else {
            candle_nn::conv2d_no_bias(in_channels, out_channels, kernel_size, conv_cfg, vb)?
        };
        let padding =
            SamePadding::for_image_size(image_size, kernel_size, cfg.stride, cfg.dilation);

        Ok(Conv2dSame {
            conv,
            kernel_size,
            cfg,
            padding,
            image_size,
        })
    }

    pub fn padding(&self) -> SamePadding {
        self.padding
    }

    pub fn weight(&self) -> &Tensor {
        self.conv.weight()
    }

    fn pads(&self, xs: &Tensor) -> Result<(usize, usize, usize, usize)> {
        let (_, _, h, w) = xs.dims4()?;
        match self.padding {
            SamePadding::Static {
                top,
                bottom,
                left,
                right,
            } if self.image_size == Some((h, w)) => Ok((top, bottom, left, right)),
            _ => {
                let k = self.kernel_size;
                let (top, bottom) = same_padding(h, k, self.cfg.stride, self.cfg.dilation);
                let (left, right) = same_padding(w, k, self.cfg.stride, self.cfg.dilation);
                Ok((top, bottom, left, right))
            }
        }
    }
}

impl Module for Conv2dSame {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (top, bottom, left, right) = self.pads(xs)?;
        if top + bottom + left + right == 0 {
            return self.conv.forward(xs);
        }
        let xs = xs
            .pad_with_zeros(2, top, bottom)?
            .pad_with_zeros(3, left, right)?;
        self.conv.forward(&xs)
    }
}
