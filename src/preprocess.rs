use crate::Result;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Loads an image as a `(1, 3, size, size)` tensor normalized with the
/// ImageNet statistics the pretrained weights expect.
pub fn image_preprocess<T: AsRef<std::path::Path>>(
    path: T,
    size: usize,
) -> Result<candle_core::Tensor> {
    let img = image::io::Reader::open(path)?.decode()?;
    let img = img.resize_to_fill(
        size as u32,
        size as u32,
        image::imageops::FilterType::CatmullRom,
    );
    let img = img.to_rgb8();
    let img = img.into_raw();
    let img = candle_core::Tensor::from_vec(img, (size, size, 3), &candle_core::Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(candle_core::DType::F32)?
        .affine(1. / 255., 0.)?;
    Ok(normalize(&img)?.unsqueeze(0)?)
}

/// Per-channel ImageNet normalization of a `(3, h, w)` tensor in `[0, 1]`.
pub fn normalize(img: &candle_core::Tensor) -> candle_core::Result<candle_core::Tensor> {
    let device = img.device();
    let mean = candle_core::Tensor::new(&IMAGENET_MEAN, device)?.reshape((3, 1, 1))?;
    let std = candle_core::Tensor::new(&IMAGENET_STD, device)?.reshape((3, 1, 1))?;
    img.broadcast_sub(&mean)?.broadcast_div(&std)
}
