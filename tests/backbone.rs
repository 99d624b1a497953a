use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use efficientnet_backbone::scaling::{round_filters, GlobalParamsOverrides, Variant, EFFICIENTNET_BLOCKS};
use efficientnet_backbone::{
    build_backbone, BackboneConfig, EfficientNet, FeatureLevel, PretrainedOptions,
};

fn small_overrides() -> GlobalParamsOverrides {
    GlobalParamsOverrides {
        width_coefficient: Some(0.25),
        depth_coefficient: Some(0.5),
        ..Default::default()
    }
}

fn var(varmap: &VarMap, name: &str) -> Vec<f32> {
    varmap.data().lock().unwrap()[name]
        .as_tensor()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap()
}

#[test]
fn b0_res5_at_native_resolution() {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model =
        EfficientNet::from_name("efficientnet-b0", None, Some(vec![FeatureLevel::Res(5)]), vb)
            .unwrap();
    let size = EfficientNet::get_image_size("efficientnet-b0").unwrap();
    assert_eq!(size, 224);

    let xs = Tensor::randn(0f32, 1., (2, 3, size, size), &device).unwrap();
    let outputs = model.forward(&xs, false).unwrap();
    assert_eq!(outputs.len(), 1);

    let channels = round_filters(EFFICIENTNET_BLOCKS[6].output_filters, &Variant::B0.global_params());
    assert_eq!(
        outputs[&FeatureLevel::Res(5)].dims(),
        &[2, channels, size / 32, size / 32]
    );
}

#[test]
fn b0_off_resolution_keeps_ceil_strides() {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let config = BackboneConfig {
        out_features: vec![FeatureLevel::Res(3), FeatureLevel::Res(5)],
        ..Default::default()
    };
    let model = build_backbone(&config, &varmap, DType::F32, &device).unwrap();

    let xs = Tensor::randn(0f32, 1., (1, 3, 100, 100), &device).unwrap();
    let outputs = model.forward(&xs, false).unwrap();
    for (level, shape) in model.output_shape() {
        let side = 100usize.div_ceil(shape.stride);
        assert_eq!(outputs[&level].dims(), &[1, shape.channels, side, side], "{level}");
    }
    assert_eq!(outputs[&FeatureLevel::Res(3)].dims()[2..], [13, 13]);
    assert_eq!(outputs[&FeatureLevel::Res(5)].dims()[2..], [4, 4]);
}

#[test]
fn pretrained_weights_skip_classifier_and_stem() {
    let dir = tempfile::tempdir().unwrap();
    let weights = dir.path().join("efficientnet-b0.safetensors");
    let device = Device::Cpu;

    let source = VarMap::new();
    let options = PretrainedOptions {
        overrides: Some(small_overrides()),
        ..Default::default()
    };
    EfficientNet::from_pretrained("efficientnet-b0", &options, &source, DType::F32, &device)
        .unwrap();
    source.save(&weights).unwrap();

    // Same architecture, every weight is loaded.
    let same = VarMap::new();
    let options = PretrainedOptions {
        weights: Some(weights.clone()),
        overrides: Some(small_overrides()),
        ..Default::default()
    };
    EfficientNet::from_pretrained("efficientnet-b0", &options, &same, DType::F32, &device)
        .unwrap();
    for name in ["stem.0.weight", "_fc.weight", "_blocks.3._se_reduce.bias"] {
        assert_eq!(var(&source, name), var(&same, name), "{name}");
    }

    // Different class count and a single channel input.
    let target = VarMap::new();
    let options = PretrainedOptions {
        weights: Some(weights),
        num_classes: 7,
        in_channels: 1,
        overrides: Some(small_overrides()),
        ..Default::default()
    };
    let model =
        EfficientNet::from_pretrained("efficientnet-b0", &options, &target, DType::F32, &device)
            .unwrap();
    assert_eq!(model.global_params().num_classes, 7);
    assert_eq!(var(&source, "_blocks.1._depthwise_conv.weight"), var(&target, "_blocks.1._depthwise_conv.weight"));
    assert_eq!(var(&source, "stem.1.weight"), var(&target, "stem.1.weight"));
    assert_eq!(var(&target, "stem.0.weight").len(), 8 * 3 * 3);
    assert_eq!(var(&target, "_fc.weight").len(), 7 * 320);

    let xs = Tensor::randn(0f32, 1., (1, 1, 64, 64), &device).unwrap();
    let (head, _) = model.extract_features(&xs, false).unwrap();
    assert_eq!(head.dims(), &[1, 320, 2, 2]);
}

#[test]
fn missing_weights_file_is_an_error() {
    let varmap = VarMap::new();
    let options = PretrainedOptions {
        weights: Some("/nonexistent/efficientnet-b0.safetensors".into()),
        overrides: Some(small_overrides()),
        ..Default::default()
    };
    assert!(
        EfficientNet::from_pretrained("efficientnet-b0", &options, &varmap, DType::F32, &Device::Cpu)
            .is_err()
    );
}

#[test]
fn config_file_builds_detection_backbone() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backbone.json");
    std::fs::write(
        &path,
        r#"{
            "name": "efficientnet-b1",
            "out_features": ["res3", "res4", "res5"],
            "num_classes": 80,
            "freeze_at": 1,
            "overrides": {"width_coefficient": 0.25, "depth_coefficient": 0.5, "image_size": null}
        }"#,
    )
    .unwrap();
    let config = BackboneConfig::from_file(&path).unwrap();
    let varmap = VarMap::new();
    let model = build_backbone(&config, &varmap, DType::F32, &Device::Cpu).unwrap();

    let shapes = model.output_shape();
    let strides: Vec<_> = shapes.values().map(|s| s.stride).collect();
    assert_eq!(strides, vec![8, 16, 32]);

    let xs = Tensor::randn(0f32, 1., (2, 3, 96, 96), &Device::Cpu).unwrap();
    let outputs = model.forward(&xs, true).unwrap();
    for (level, tensor) in &outputs {
        let spec = shapes[level];
        assert_eq!(tensor.dims(), &[2, spec.channels, 96 / spec.stride, 96 / spec.stride]);
    }
    assert_eq!(outputs.len(), 3);
}
