pub mod checkpoint;
pub mod config;
pub mod error;
pub mod model;
pub mod preprocess;
pub mod same_padding;
pub mod scaling;
pub mod squeeze_excitation;

pub use config::{build_backbone, BackboneConfig};
pub use error::{BackboneError, Result};
pub use model::efficientnet::{EfficientNet, PretrainedOptions};
pub use model::features::{FeatureLevel, FeatureMaps, ShapeSpec};

pub fn parse_device(device: Option<String>) -> candle_core::Result<candle_core::Device> {
    match device.as_deref() {
        Some("cpu") => Ok(candle_core::Device::Cpu),
        Some("cuda") => candle_core::Device::cuda_if_available(0),
        Some(ordinal) => match ordinal.parse::<usize>() {
            Ok(ordinal) => candle_core::Device::cuda_if_available(ordinal),
            Err(_) => candle_core::bail!("unknown device {ordinal:?}, expected cpu, cuda or an ordinal"),
        },
        None => candle_core::Device::cuda_if_available(0),
    }
}

pub fn set_seed(seed: Option<u64>, device: &candle_core::Device) -> candle_core::Result<()> {
    match device {
        candle_core::Device::Cpu => {
            tracing::info!("Device: CPU");
        }
        _ => {
            let seed = seed.unwrap_or(1234);
            tracing::info!(seed, "Device: {:?}", device.location());
            device.set_seed(seed)?;
        }
    };

    Ok(())
}

pub fn adaptive_avg_pool_2d(xs: &candle_core::Tensor) -> candle_core::Result<candle_core::Tensor> {
    xs.mean_keepdim(candle_core::D::Minus2)?
        .mean_keepdim(candle_core::D::Minus1)
}

/// Installs the fmt subscriber used by the binaries, `info` unless `RUST_LOG`
/// says otherwise.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_device_is_parsed() {
        assert!(parse_device(Some("cpu".to_string())).unwrap().is_cpu());
        assert!(parse_device(Some("gpu0".to_string())).is_err());
    }

    #[test]
    fn pool_keeps_rank() {
        let xs = candle_core::Tensor::arange(0f32, 16., &candle_core::Device::Cpu)
            .unwrap()
            .reshape((1, 1, 4, 4))
            .unwrap();
        let pooled = adaptive_avg_pool_2d(&xs).unwrap();
        assert_eq!(pooled.dims(), &[1, 1, 1, 1]);
        assert_eq!(pooled.flatten_all().unwrap().to_vec1::<f32>().unwrap(), vec![7.5]);
    }
}
