//! Congenital heart disease screening from chest radiographs: classification
//! into ASD / Normal / PDA / VSD with Grad-CAM localization overlays.

pub mod composite;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod labels;
pub mod localize;
pub mod logging;
pub mod model;
pub mod preprocess;
pub mod runtime;
pub mod server;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use engine::{InferenceEngine, PredictOptions, PredictionRecord};
pub use error::{ChdError, Result};
pub use labels::ChdClass;
