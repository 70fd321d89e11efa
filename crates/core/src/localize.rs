//! Gradient-weighted class activation mapping (Grad-CAM).
//!
//! One [`GradCam::compute`] call runs, under an internal lock:
//!
//! 1. register a [`FeatureRecorder`] on the classifier's capture point,
//! 2. a graph-retaining forward pass,
//! 3. a backward pass seeded with the one-hot target class,
//! 4. release of the hook (guard drop, also on error),
//!
//! then reduces the recorded activation/gradient pair into a `[0, 1]` map at
//! input resolution.

use std::sync::{Arc, Mutex, PoisonError};

use ndarray::{Array2, Array3, ArrayView2, Axis};
use tracing::debug;

use crate::error::{ChdError, Result};
use crate::labels::{ChdClass, NUM_CLASSES};
use crate::model::{Classifier, FeatureRecorder};
use crate::preprocess::{InputTensor, INPUT_SIZE};

/// Guards the min-max normalization when the map is constant.
pub const NORMALIZE_EPSILON: f32 = 1e-8;

/// Single-channel importance map with values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportanceMap(Array2<f32>);

impl ImportanceMap {
    /// Wrap an already normalized map; values are clamped to `[0, 1]`.
    pub fn from_array(mut map: Array2<f32>) -> Self {
        map.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) });
        Self(map)
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.0.view()
    }

    /// `(height, width)`.
    pub fn dim(&self) -> (usize, usize) {
        self.0.dim()
    }

    pub fn into_inner(self) -> Array2<f32> {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct GradCam {
    sequence: Mutex<()>,
}

impl GradCam {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the hooked forward+backward sequence and return what the
    /// request-scoped recorder saw.
    pub fn capture(
        &self,
        classifier: &Classifier,
        input: &InputTensor,
        target: ChdClass,
    ) -> Result<Arc<FeatureRecorder>> {
        let _sequence = self.sequence.lock().unwrap_or_else(PoisonError::into_inner);

        let recorder = Arc::new(FeatureRecorder::new());
        let _hook = classifier.capture_point().register(recorder.clone());

        let graph = classifier.forward_graph(input)?;
        graph.backward(&one_hot(target));

        Ok(recorder)
    }

    pub fn compute(
        &self,
        classifier: &Classifier,
        input: &InputTensor,
        target: ChdClass,
    ) -> Result<ImportanceMap> {
        let recorder = self.capture(classifier, input, target)?;

        let activations = recorder.activations();
        let gradients = recorder.gradients();
        let (activation, gradient) = match (activations.as_slice(), gradients.as_slice()) {
            ([activation], [gradient]) => (activation, gradient),
            (_, []) => {
                return Err(ChdError::Localization(format!(
                    "no gradient reached capture point '{}'",
                    classifier.capture_point().layer()
                )))
            }
            (a, g) => {
                return Err(ChdError::Localization(format!(
                    "expected one activation and one gradient, captured {} and {}",
                    a.len(),
                    g.len()
                )))
            }
        };

        let coarse = weighted_activation(activation, gradient)?;
        debug!(
            target = %target,
            feature_h = coarse.nrows(),
            feature_w = coarse.ncols(),
            "Computed class activation map"
        );

        let upsampled = upsample_bilinear(coarse.view(), INPUT_SIZE, INPUT_SIZE);
        Ok(ImportanceMap(normalize_min_max(upsampled)))
    }
}

fn one_hot(target: ChdClass) -> [f32; NUM_CLASSES] {
    let mut seed = [0.0; NUM_CLASSES];
    seed[target.index()] = 1.0;
    seed
}

/// `ReLU(Σ_k mean(grad_k) · A_k)` over `[C, h, w]` tensors.
pub fn weighted_activation(
    activation: &Array3<f32>,
    gradient: &Array3<f32>,
) -> Result<Array2<f32>> {
    if activation.dim() != gradient.dim() {
        return Err(ChdError::Localization(format!(
            "activation {:?} and gradient {:?} differ in shape",
            activation.shape(),
            gradient.shape()
        )));
    }
    let (_, height, width) = activation.dim();
    let weights = gradient
        .mean_axis(Axis(2))
        .and_then(|m| m.mean_axis(Axis(1)))
        .ok_or_else(|| ChdError::Localization("capture point has no spatial extent".into()))?;

    let mut cam = Array2::<f32>::zeros((height, width));
    for (channel, weight) in activation.outer_iter().zip(weights.iter()) {
        cam.scaled_add(*weight, &channel);
    }
    cam.mapv_inplace(|v| v.max(0.0));
    Ok(cam)
}

/// Bilinear resize with half-pixel centers (no corner alignment).
pub fn upsample_bilinear(src: ArrayView2<'_, f32>, dst_h: usize, dst_w: usize) -> Array2<f32> {
    let (src_h, src_w) = src.dim();
    let mut dst = Array2::<f32>::zeros((dst_h, dst_w));
    if src_h == 0 || src_w == 0 {
        return dst;
    }

    for dst_y in 0..dst_h {
        // Map destination pixel center to source coordinates
        let src_yf = (dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64 - 0.5;
        let src_y0 = (src_yf.floor().max(0.0) as usize).min(src_h - 1);
        let src_y1 = (src_y0 + 1).min(src_h - 1);
        let fy = (src_yf - src_y0 as f64).clamp(0.0, 1.0) as f32;

        for dst_x in 0..dst_w {
            let src_xf = (dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64 - 0.5;
            let src_x0 = (src_xf.floor().max(0.0) as usize).min(src_w - 1);
            let src_x1 = (src_x0 + 1).min(src_w - 1);
            let fx = (src_xf - src_x0 as f64).clamp(0.0, 1.0) as f32;

            let top = src[[src_y0, src_x0]] * (1.0 - fx) + src[[src_y0, src_x1]] * fx;
            let bot = src[[src_y1, src_x0]] * (1.0 - fx) + src[[src_y1, src_x1]] * fx;
            dst[[dst_y, dst_x]] = top * (1.0 - fy) + bot * fy;
        }
    }

    dst
}

/// `(x - min) / (max - min + ε)`. A constant map becomes all zeros.
pub fn normalize_min_max(mut map: Array2<f32>) -> Array2<f32> {
    let min = map.iter().copied().fold(f32::INFINITY, f32::min);
    let max = map.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !min.is_finite() || !max.is_finite() {
        map.fill(0.0);
        return map;
    }
    let range = max - min + NORMALIZE_EPSILON;
    map.mapv_inplace(|v| ((v - min) / range).clamp(0.0, 1.0));
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::{PreprocessStrategy, Preprocessor};
    use crate::test_support::{sample_image, synthetic_classifier};
    use ndarray::arr2;

    #[test]
    fn weighted_activation_pools_gradients_and_rectifies() {
        let mut activation = Array3::<f32>::zeros((2, 2, 2));
        activation
            .index_axis_mut(Axis(0), 0)
            .assign(&arr2(&[[1.0, 2.0], [3.0, 4.0]]));
        activation
            .index_axis_mut(Axis(0), 1)
            .assign(&arr2(&[[4.0, 0.0], [0.0, 0.0]]));

        let mut gradient = Array3::<f32>::zeros((2, 2, 2));
        gradient.index_axis_mut(Axis(0), 0).fill(1.0);
        // Channel 1 weight averages to -1.
        gradient
            .index_axis_mut(Axis(0), 1)
            .assign(&arr2(&[[-4.0, 0.0], [0.0, 0.0]]));

        let cam = weighted_activation(&activation, &gradient).unwrap();
        assert_eq!(cam, arr2(&[[0.0, 2.0], [3.0, 4.0]]));
    }

    #[test]
    fn weighted_activation_rejects_shape_mismatch() {
        let err = weighted_activation(&Array3::zeros((2, 3, 3)), &Array3::zeros((2, 4, 4)))
            .unwrap_err();
        assert!(matches!(err, ChdError::Localization(_)));
    }

    #[test]
    fn upsample_constant_stays_constant() {
        let src = Array2::from_elem((7, 7), 0.3f32);
        let dst = upsample_bilinear(src.view(), 224, 224);
        assert_eq!(dst.dim(), (224, 224));
        assert!(dst.iter().all(|v| (*v - 0.3).abs() < 1e-6));
    }

    #[test]
    fn upsample_uses_half_pixel_centers() {
        let src = arr2(&[[0.0f32, 1.0]]);
        let dst = upsample_bilinear(src.view(), 1, 4);
        // Centers map to -0.25, 0.25, 0.75, 1.25 and clamp at the borders.
        assert_eq!(dst.row(0).to_vec(), vec![0.0, 0.25, 0.75, 1.0]);
    }

    #[test]
    fn normalize_spans_unit_interval() {
        let map = normalize_min_max(arr2(&[[2.0f32, 4.0], [6.0, 10.0]]));
        let min = map.iter().copied().fold(f32::INFINITY, f32::min);
        let max = map.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        assert_eq!(min, 0.0);
        assert!((max - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_constant_map_is_all_zero() {
        let map = normalize_min_max(Array2::from_elem((4, 4), 5.0f32));
        assert!(map.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn compute_yields_input_sized_unit_map() {
        let classifier = synthetic_classifier();
        let cam = GradCam::new();
        let map = cam
            .compute(&classifier, &InputTensor::zeros(), ChdClass::Vsd)
            .unwrap();
        assert_eq!(map.dim(), (INPUT_SIZE, INPUT_SIZE));
        assert!(map.view().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn repeated_compute_never_leaks_hooks() {
        let classifier = synthetic_classifier();
        let cam = GradCam::new();
        let input = InputTensor::zeros();

        for _ in 0..3 {
            let recorder = cam.capture(&classifier, &input, ChdClass::Asd).unwrap();
            assert_eq!(recorder.activation_count(), 1);
            assert_eq!(recorder.gradient_count(), 1);
            assert_eq!(classifier.capture_point().registered_count(), 0);
        }
    }

    #[test]
    fn concurrent_captures_on_shared_classifier_stay_isolated() {
        let classifier = synthetic_classifier();
        let cam = GradCam::new();
        let input = Preprocessor::new(PreprocessStrategy::Grayscale)
            .transform(&sample_image())
            .unwrap();

        let expected: Vec<_> = ChdClass::ALL
            .iter()
            .map(|class| cam.capture(&classifier, &input, *class).unwrap().gradients())
            .collect();

        let captured: Vec<(ChdClass, Arc<FeatureRecorder>)> = std::thread::scope(|scope| {
            let workers: Vec<_> = ChdClass::ALL
                .iter()
                .cycle()
                .take(8)
                .map(|class| {
                    let (cam, classifier, input) = (&cam, &classifier, &input);
                    scope.spawn(move || {
                        (*class, cam.capture(classifier, input, *class).unwrap())
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(captured.len(), 8);
        for (class, recorder) in &captured {
            assert_eq!(recorder.activation_count(), 1);
            assert_eq!(recorder.gradient_count(), 1);
            assert_eq!(recorder.gradients(), expected[class.index()]);
        }
        assert_eq!(classifier.capture_point().registered_count(), 0);
    }

    #[test]
    fn detached_capture_point_is_localization_error() {
        let classifier = synthetic_classifier();
        classifier.capture_point().set_requires_grad(false);

        let err = GradCam::new()
            .compute(&classifier, &InputTensor::zeros(), ChdClass::Pda)
            .unwrap_err();
        assert!(matches!(err, ChdError::Localization(_)));
        assert_eq!(classifier.capture_point().registered_count(), 0);
    }

    #[test]
    fn gradient_sign_follows_target_class() {
        let classifier = synthetic_classifier();
        let cam = GradCam::new();
        let input = InputTensor::zeros();

        let asd = cam.capture(&classifier, &input, ChdClass::Asd).unwrap();
        let vsd = cam.capture(&classifier, &input, ChdClass::Vsd).unwrap();
        assert_ne!(asd.gradients()[0], vsd.gradients()[0]);
        assert_eq!(asd.activations()[0], vsd.activations()[0]);
    }
}
