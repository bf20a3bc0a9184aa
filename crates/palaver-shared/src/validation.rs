//! Field-level validation applied at the boundary, before anything reaches a
//! handler or the store.

use thiserror::Error;

use crate::constants::{
    MAX_EMOJI_BYTES, MAX_IMAGE_REF_BYTES, MAX_STATUS_CHARS, MAX_TEXT_CHARS, MAX_USERNAME_LEN,
    MIN_USERNAME_LEN,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{field} is too long (max {max})")]
    TooLong { field: &'static str, max: usize },

    #[error("{0} is too short")]
    TooShort(&'static str),

    #[error("{0} contains invalid characters")]
    InvalidCharacters(&'static str),

    #[error("Message must contain text or an image")]
    MissingContent,
}

/// Validated body of a new message: text and/or image, at least one present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContent {
    text: Option<String>,
    image: Option<String>,
}

impl MessageContent {
    pub fn new(text: Option<&str>, image: Option<&str>) -> Result<Self, ValidationError> {
        let text = match text.map(str::trim) {
            Some(t) if !t.is_empty() => Some(validate_text(t)?),
            _ => None,
        };
        let image = match image.map(str::trim) {
            Some(i) if !i.is_empty() => Some(validate_image_ref(i)?),
            _ => None,
        };
        if text.is_none() && image.is_none() {
            return Err(ValidationError::MissingContent);
        }
        Ok(Self { text, image })
    }

    pub fn into_parts(self) -> (Option<String>, Option<String>) {
        (self.text, self.image)
    }
}

/// Trim and bound message text. Length is counted in characters.
pub fn validate_text(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty("text"));
    }
    if trimmed.chars().count() > MAX_TEXT_CHARS {
        return Err(ValidationError::TooLong {
            field: "text",
            max: MAX_TEXT_CHARS,
        });
    }
    Ok(trimmed.to_string())
}

pub fn validate_image_ref(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty("image"));
    }
    if trimmed.len() > MAX_IMAGE_REF_BYTES {
        return Err(ValidationError::TooLong {
            field: "image",
            max: MAX_IMAGE_REF_BYTES,
        });
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidCharacters("image"));
    }
    Ok(trimmed.to_string())
}

pub fn validate_emoji(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty("emoji"));
    }
    if trimmed.len() > MAX_EMOJI_BYTES {
        return Err(ValidationError::TooLong {
            field: "emoji",
            max: MAX_EMOJI_BYTES,
        });
    }
    if trimmed.chars().any(char::is_whitespace) || trimmed.is_ascii() {
        return Err(ValidationError::InvalidCharacters("emoji"));
    }
    Ok(trimmed.to_string())
}

/// Usernames: 3-24 chars of letters, digits and underscores.
pub fn validate_username(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty("username"));
    }
    let len = trimmed.chars().count();
    if len < MIN_USERNAME_LEN {
        return Err(ValidationError::TooShort("username"));
    }
    if len > MAX_USERNAME_LEN {
        return Err(ValidationError::TooLong {
            field: "username",
            max: MAX_USERNAME_LEN,
        });
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(ValidationError::InvalidCharacters("username"));
    }
    Ok(trimmed.to_string())
}

pub fn validate_status(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.chars().count() > MAX_STATUS_CHARS {
        return Err(ValidationError::TooLong {
            field: "status",
            max: MAX_STATUS_CHARS,
        });
    }
    Ok(trimmed.to_string())
}
