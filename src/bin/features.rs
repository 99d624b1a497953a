use candle_nn::VarMap;
use clap::Parser;
use efficientnet_backbone::preprocess::image_preprocess;
use efficientnet_backbone::{
    build_backbone, init_tracing, parse_device, set_seed, BackboneConfig, EfficientNet,
    FeatureLevel,
};

/// Run an EfficientNet backbone on an image and print its feature maps
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Image to run through the backbone
    #[arg(short, long)]
    image: String,

    /// Backbone config (JSON), defaults to efficientnet-b0 with res5
    #[arg(short, long)]
    config: Option<String>,

    /// Model name, overrides the config
    #[arg(short, long)]
    model: Option<String>,

    /// Pretrained weights (safetensors), overrides the config
    #[arg(short, long)]
    weights: Option<String>,

    /// Feature levels to print (stem, res1..res5, linear), overrides the config
    #[arg(long, value_delimiter = ',')]
    out_features: Vec<String>,

    /// Seed (not usable on CPU)
    #[arg(short, long)]
    seed: Option<u64>,

    /// Device (cpu, cuda, 0, 1, ...)
    #[arg(short, long)]
    device: Option<String>,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let dtype = candle_core::DType::F32;

    let device = parse_device(args.device)?;
    set_seed(args.seed, &device)?;

    let mut config = match &args.config {
        Some(path) => BackboneConfig::from_file(path)?,
        None => BackboneConfig::default(),
    };
    if let Some(model) = args.model {
        config.name = model;
    }
    if let Some(weights) = args.weights {
        config.pretrained = Some(weights.into());
    }
    if !args.out_features.is_empty() {
        config.out_features = efficientnet_backbone::model::features::parse_feature_levels(
            &args.out_features,
        )?;
    }

    let varmap = VarMap::new();
    let model = build_backbone(&config, &varmap, dtype, &device)?;

    let size = EfficientNet::get_image_size(&config.name)?;
    let xs = image_preprocess(&args.image, size)?
        .to_device(&device)?
        .to_dtype(dtype)?;

    let shapes = model.output_shape();
    let outputs = model.forward(&xs, false)?;
    for (level, tensor) in &outputs {
        let spec = shapes[level];
        println!(
            "{level}: {:?} (channels {}, stride {})",
            tensor.dims(),
            spec.channels,
            spec.stride
        );
    }

    if let Some(logits) = outputs.get(&FeatureLevel::Linear) {
        let probs = candle_nn::ops::softmax(&logits.squeeze(0)?, 0)?;
        let best = probs.argmax(0)?.to_scalar::<u32>()?;
        let p = probs.get(best as usize)?.to_scalar::<f32>()?;
        println!("top class {best} ({:.2}%)", p * 100.);
    }

    Ok(())
}
