use serde::{Deserialize, Serialize};

pub const INTERNAL_SERVER_ERROR_MESSAGE: &str = "Internal server error";

/// Public error body. Never carries internal details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn internal() -> Self {
        Self::new(INTERNAL_SERVER_ERROR_MESSAGE)
    }
}
