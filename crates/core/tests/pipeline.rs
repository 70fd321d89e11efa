mod common;

use std::path::PathBuf;

use cardiocam_core::config::{config_path, initialize_data_dir, AppConfig};
use cardiocam_core::engine::{InferenceEngine, PredictOptions};
use cardiocam_core::error::ChdError;
use cardiocam_core::history::{HistoryEntry, HistoryStore, InMemoryHistory};
use cardiocam_core::labels::{ChdClass, NUM_CLASSES};
use cardiocam_core::localize::GradCam;
use cardiocam_core::model::Classifier;
use cardiocam_core::preprocess::{InputTensor, Preprocessor, INPUT_SIZE};
use image::{GenericImageView, ImageFormat};
use ndarray::Array2;
use tempfile::tempdir;

use common::{
    encode, native_config, patterned_image, prepare_data_dir, synthetic_parameters_with_bias,
    uniform_gray, STAGES, WEIGHTS_FILE,
};

const BIAS: [f32; NUM_CLASSES] = [0.05, -0.1, 0.0, 0.1];

#[test]
fn uniform_gray_image_yields_record_with_overlay() {
    let data_dir = tempdir().expect("tempdir");
    let config = prepare_data_dir(data_dir.path(), BIAS);
    let engine = InferenceEngine::load(&config, data_dir.path()).expect("engine loads");

    let record = engine.predict(&uniform_gray(224)).expect("prediction");

    assert!(ChdClass::ALL.contains(&record.label));
    assert!((0.0..=100.0).contains(&record.confidence));
    let overlay = record.overlay.expect("overlay present");
    let decoded = image::load_from_memory(overlay.png()).expect("overlay decodes");
    assert_eq!(decoded.dimensions(), (INPUT_SIZE as u32, INPUT_SIZE as u32));
}

#[test]
fn undecodable_bytes_fail_without_touching_history() {
    let data_dir = tempdir().expect("tempdir");
    let config = prepare_data_dir(data_dir.path(), BIAS);
    let engine = InferenceEngine::load(&config, data_dir.path()).expect("engine loads");
    let history = InMemoryHistory::new();

    let result = engine
        .predict_bytes(b"GIF89a-but-not-really", PredictOptions::default())
        .map(|record| history.append(HistoryEntry::now(record.label, record.confidence)));

    assert!(matches!(result, Err(ChdError::InvalidImage(_))));
    assert!(history.list().is_empty());
}

#[test]
fn missing_weights_fail_construction() {
    let data_dir = tempdir().expect("tempdir");
    let config = native_config(PathBuf::from("models/absent.onnx"));

    let err = InferenceEngine::load(&config, data_dir.path()).expect_err("load must fail");
    assert!(matches!(err, ChdError::ModelLoad(_)));
    assert!(err.is_fatal());
}

#[test]
fn detached_capture_point_drops_overlay_only() {
    let data_dir = tempdir().expect("tempdir");
    let config = prepare_data_dir(data_dir.path(), BIAS);
    let engine = InferenceEngine::load(&config, data_dir.path()).expect("engine loads");
    let image = patterned_image();

    let baseline = engine
        .predict_with(&image, PredictOptions { explain: false })
        .expect("baseline");
    engine.classifier().capture_point().set_requires_grad(false);
    let degraded = engine.predict(&image).expect("degraded prediction");

    assert!(degraded.overlay.is_none());
    assert_eq!(degraded.label, baseline.label);
    assert_eq!(degraded.confidence, baseline.confidence);
    assert_eq!(degraded.probabilities, baseline.probabilities);
}

#[test]
fn repeated_predictions_are_deterministic() {
    let data_dir = tempdir().expect("tempdir");
    let config = prepare_data_dir(data_dir.path(), BIAS);
    let engine = InferenceEngine::load(&config, data_dir.path()).expect("engine loads");
    let image = patterned_image();

    let first = engine.predict(&image).expect("first");
    let second = engine.predict(&image).expect("second");

    assert_eq!(first, second);
    assert_eq!(engine.classifier().capture_point().registered_count(), 0);
}

#[test]
fn encoded_and_decoded_inputs_agree() {
    let data_dir = tempdir().expect("tempdir");
    let config = prepare_data_dir(data_dir.path(), BIAS);
    let engine = InferenceEngine::load(&config, data_dir.path()).expect("engine loads");
    let image = patterned_image();

    let direct = engine.predict(&image).expect("direct");
    let via_png = engine
        .predict_bytes(&encode(&image, ImageFormat::Png), PredictOptions::default())
        .expect("png");
    assert_eq!(direct.label, via_png.label);
    assert_eq!(direct.confidence, via_png.confidence);
}

#[test]
fn softmax_of_zero_input_sums_to_one() {
    let data_dir = tempdir().expect("tempdir");
    let config = prepare_data_dir(data_dir.path(), BIAS);
    let classifier =
        Classifier::load(&config.model, &data_dir.path().join(WEIGHTS_FILE)).expect("classifier");

    let probabilities = classifier
        .forward(&InputTensor::zeros())
        .expect("forward")
        .softmax();
    assert!((probabilities.sum() - 1.0).abs() < 1e-5);
    assert!(probabilities.0.iter().all(|p| (0.0..=1.0).contains(p)));
}

#[test]
fn inference_pass_matches_gradient_pass_logits() {
    let data_dir = tempdir().expect("tempdir");
    let config = prepare_data_dir(data_dir.path(), BIAS);
    let classifier =
        Classifier::load(&config.model, &data_dir.path().join(WEIGHTS_FILE)).expect("classifier");
    let strategy = config.preprocess.strategy().expect("strategy");
    let input = Preprocessor::new(strategy)
        .transform(&patterned_image())
        .expect("transform");

    let plain = classifier.forward(&input).expect("forward");
    let graph = classifier.forward_graph(&input).expect("forward graph");
    assert_eq!(plain, graph.logits());
}

#[test]
fn hooks_are_released_after_every_localization() {
    let data_dir = tempdir().expect("tempdir");
    let config = prepare_data_dir(data_dir.path(), BIAS);
    let classifier =
        Classifier::load(&config.model, &data_dir.path().join(WEIGHTS_FILE)).expect("classifier");
    let localizer = GradCam::new();
    let input = InputTensor::zeros();

    for class in ChdClass::ALL {
        let map = localizer
            .compute(&classifier, &input, class)
            .expect("importance map");
        assert_eq!(map.dim(), (INPUT_SIZE, INPUT_SIZE));
        assert_eq!(classifier.capture_point().registered_count(), 0);
    }

    classifier.capture_point().set_requires_grad(false);
    assert!(localizer.compute(&classifier, &input, ChdClass::Asd).is_err());
    assert_eq!(classifier.capture_point().registered_count(), 0);
}

#[test]
fn tied_logits_resolve_to_first_class() {
    let data_dir = tempdir().expect("tempdir");
    let weights_path = data_dir.path().join(WEIGHTS_FILE);
    std::fs::create_dir_all(weights_path.parent().expect("parent")).expect("models dir");

    let channels = *STAGES.last().expect("stages");
    let mut params = synthetic_parameters_with_bias(&STAGES, [0.3; NUM_CLASSES]);
    params.insert(
        "fc.1.weight",
        Array2::<f32>::zeros((NUM_CLASSES, channels)).into_dyn(),
    );
    params.save(&weights_path).expect("write weights");

    let engine = InferenceEngine::load(
        &native_config(PathBuf::from(WEIGHTS_FILE)),
        data_dir.path(),
    )
    .expect("engine loads");
    let record = engine.predict(&patterned_image()).expect("prediction");

    assert_eq!(record.label, ChdClass::Asd);
    assert_eq!(record.confidence, 25.0);
    // A flat gradient still renders, as an all-zero importance map.
    assert!(record.overlay.is_some());
}

#[test]
fn config_file_drives_clahe_preprocessing() {
    let data_dir = tempdir().expect("tempdir");
    prepare_data_dir(data_dir.path(), BIAS);
    initialize_data_dir(data_dir.path()).expect("init data dir");

    let mut config = AppConfig::load_from_path(&config_path(data_dir.path())).expect("config");
    config.model = native_config(PathBuf::from(WEIGHTS_FILE)).model;
    config.preprocess.strategy = "imagenet".to_string();
    config.preprocess.clahe = true;
    config.explain.enabled = false;

    let engine = InferenceEngine::load(&config, data_dir.path()).expect("engine loads");
    assert_eq!(engine.summary().preprocessing, "imagenet+clahe");

    let jpeg = encode(&patterned_image(), ImageFormat::Jpeg);
    let record = engine
        .predict_bytes(&jpeg, engine.default_options())
        .expect("prediction");
    assert!(record.overlay.is_none());
    assert!((record.probabilities.sum() - 1.0).abs() < 1e-5);
}

#[test]
fn unknown_strategy_is_config_error() {
    let data_dir = tempdir().expect("tempdir");
    let mut config = prepare_data_dir(data_dir.path(), BIAS);
    config.preprocess.strategy = "sepia".to_string();

    let err = InferenceEngine::load(&config, data_dir.path()).expect_err("must fail");
    assert!(matches!(err, ChdError::Config(_)));
}
