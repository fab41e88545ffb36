// error.rs - typed failure modes for the OMR core

use thiserror::Error;

/// Every fallible entry point into the crate returns one of these.
///
/// `PreprocessingDegraded` deliberately has no variant here: all three
/// marker passes failing and falling back to a contour crop (or to the
/// unrectified input) is an expected operating state, not an error. See
/// [`crate::image_processing::RectificationOutcome`].
#[derive(Debug, Error)]
pub enum OmrError {
    #[error("invalid image: {reason}")]
    InvalidImage { reason: String },

    #[error("invalid template{}: {reason}", block.as_ref().map(|b| format!(" (block `{b}`)")).unwrap_or_default())]
    InvalidTemplate {
        block: Option<String>,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type OmrResult<T> = std::result::Result<T, OmrError>;

impl OmrError {
    pub fn invalid_image(reason: impl Into<String>) -> Self {
        OmrError::InvalidImage {
            reason: reason.into(),
        }
    }

    pub fn invalid_template(reason: impl Into<String>) -> Self {
        OmrError::InvalidTemplate {
            block: None,
            reason: reason.into(),
        }
    }

    pub fn invalid_block(block: impl Into<String>, reason: impl Into<String>) -> Self {
        OmrError::InvalidTemplate {
            block: Some(block.into()),
            reason: reason.into(),
        }
    }
}
