//! Avatar content checks.
//!
//! Validation looks only at the probe, a bounded prefix of the uploaded
//! object, so its cost does not depend on what the client uploaded. Checks
//! run in a fixed order and stop at the first failure.

use crate::config::AvatarConfig;
use image::ImageReader;
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaError {
    #[error("No content uploaded")]
    NoContentUploaded,

    #[error("Content is too large")]
    ContentTooLarge,

    #[error("Unsupported image format")]
    UnsupportedFormat,

    #[error("Image resolution is too large")]
    ResolutionTooLarge,

    #[error("Image format is not allowed")]
    FormatNotAllowed,

    #[error("Content type is not allowed")]
    ContentTypeNotAllowed,
}

impl MediaError {
    pub fn code(&self) -> &'static str {
        match self {
            MediaError::NoContentUploaded => "NO_CONTENT_UPLOADED",
            MediaError::ContentTooLarge => "CONTENT_TOO_LARGE",
            MediaError::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            MediaError::ResolutionTooLarge => "RESOLUTION_TOO_LARGE",
            MediaError::FormatNotAllowed => "FORMAT_NOT_ALLOWED",
            MediaError::ContentTypeNotAllowed => "CONTENT_TYPE_NOT_ALLOWED",
        }
    }
}

/// What a probe looked like once it passed every check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInfo {
    pub format: String,
    pub content_type: String,
    pub width: u32,
    pub height: u32,
}

/// Immutable avatar policy, built from the `avatar` config section
#[derive(Debug, Clone)]
pub struct MediaValidator {
    max_content_length: u64,
    max_width: u32,
    max_height: u32,
    allowed_formats: Vec<String>,
    allowed_content_types: Vec<String>,
}

impl MediaValidator {
    pub fn new(config: &AvatarConfig) -> Self {
        Self {
            max_content_length: config.max_content_length,
            max_width: config.max_width,
            max_height: config.max_height,
            allowed_formats: config
                .allowed_formats
                .iter()
                .map(|f| f.to_ascii_lowercase())
                .collect(),
            allowed_content_types: config
                .allowed_content_types
                .iter()
                .map(|c| c.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Check a probe against the policy. `declared_size` is the full object size.
    pub fn validate(&self, probe: &[u8], declared_size: u64) -> Result<ProbeInfo, MediaError> {
        if declared_size == 0 {
            return Err(MediaError::NoContentUploaded);
        }
        if declared_size > self.max_content_length {
            return Err(MediaError::ContentTooLarge);
        }

        let reader = ImageReader::new(Cursor::new(probe))
            .with_guessed_format()
            .map_err(|_| MediaError::UnsupportedFormat)?;
        let format = reader.format().ok_or(MediaError::UnsupportedFormat)?;
        let (width, height) = reader
            .into_dimensions()
            .map_err(|_| MediaError::UnsupportedFormat)?;

        if width > self.max_width || height > self.max_height {
            return Err(MediaError::ResolutionTooLarge);
        }

        let extensions = format.extensions_str();
        let format_name = extensions
            .iter()
            .find(|ext| self.allowed_formats.iter().any(|a| a == *ext))
            .ok_or(MediaError::FormatNotAllowed)?;

        let content_type = infer::get(probe)
            .map(|kind| kind.mime_type())
            .filter(|mime| self.allowed_content_types.iter().any(|a| a == mime))
            .ok_or(MediaError::ContentTypeNotAllowed)?;

        Ok(ProbeInfo {
            format: format_name.to_string(),
            content_type: content_type.to_string(),
            width,
            height,
        })
    }
}
