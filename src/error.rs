use std::io;

#[derive(thiserror::Error, Debug)]
pub enum BackboneError {
    #[error("candle_core error: {0}")]
    Candle(candle_core::Error),

    #[error("Image error: {0}")]
    Image(image::ImageError),

    #[error("IO Error: {0}")]
    Io(io::Error),

    #[error("Config error: {0}")]
    Json(serde_json::Error),

    #[error("model_name {name:?} should be one of: {}", valid.join(", "))]
    InvalidVariant { name: String, valid: Vec<String> },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("checkpoint is missing the {0:?} key")]
    MissingCheckpointKey(String),

    #[error("Error: {0:?}")]
    Msg(String),
}

impl From<candle_core::Error> for BackboneError {
    fn from(value: candle_core::Error) -> Self {
        BackboneError::Candle(value)
    }
}

impl From<image::ImageError> for BackboneError {
    fn from(value: image::ImageError) -> Self {
        BackboneError::Image(value)
    }
}

impl From<io::Error> for BackboneError {
    fn from(value: io::Error) -> Self {
        BackboneError::Io(value)
    }
}

impl From<serde_json::Error> for BackboneError {
    fn from(value: serde_json::Error) -> Self {
        BackboneError::Json(value)
    }
}

pub type Result<T> = std::result::Result<T, BackboneError>;
