use thiserror::Error;

/// Failure taxonomy of the inference core.
///
/// `Config` and `ModelLoad` are fatal at startup. `InvalidImage` and
/// `Inference` fail a single request. `Localization` and `Encode` are
/// recovered by [`crate::engine::InferenceEngine`], which drops the overlay
/// instead of failing the request.
#[derive(Error, Debug)]
pub enum ChdError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("localization failed: {0}")]
    Localization(String),

    #[error("overlay encoding failed: {0}")]
    Encode(String),
}

impl ChdError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::ModelLoad(_) => "MODEL_LOAD_ERROR",
            Self::InvalidImage(_) => "INVALID_IMAGE",
            Self::Inference(_) => "INFERENCE_ERROR",
            Self::Localization(_) => "LOCALIZATION_ERROR",
            Self::Encode(_) => "ENCODE_ERROR",
        }
    }

    /// Whether the error must abort process startup.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::ModelLoad(_))
    }
}

impl From<ort::Error> for ChdError {
    fn from(err: ort::Error) -> Self {
        Self::Inference(err.to_string())
    }
}

pub type Result<T, E = ChdError> = std::result::Result<T, E>;
