//! Per-surface upload policies.
//!
//! Validation is a pure function of the request and the surface's policy. It runs at
//! initiation against the declared size and again at completion against the measured size.

use crate::models::surface::{UploadStrategy, UploadSurface};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Upper bound on parts per upload, shared with common object storage limits.
pub const MAX_PART_COUNT: u64 = 10_000;

const MAX_FILENAME_LEN: usize = 255;

const IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/gif"];
const VIDEO_TYPES: &[&str] = &["video/mp4", "video/webm", "video/quicktime"];
const AUDIO_TYPES: &[&str] = &[
    "audio/webm",
    "audio/ogg",
    "audio/mpeg",
    "audio/mp4",
    "audio/wav",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("content type `{content_type}` is not allowed for {surface} uploads")]
    InvalidType {
        content_type: String,
        surface: UploadSurface,
    },
    #[error("file of {size} bytes exceeds the {max} byte limit for {surface} uploads")]
    TooLarge {
        size: u64,
        max: u64,
        surface: UploadSurface,
    },
    #[error("file is empty")]
    EmptyFile,
    #[error("invalid filename: {0}")]
    InvalidFilename(String),
}

/// Limits applied to one upload surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPolicy {
    pub allowed_mime_types: Vec<String>,
    pub max_file_size: u64,
    pub min_part_size: u64,
    pub max_part_size: u64,
    /// Prefix every object key on this surface starts with.
    pub key_prefix: String,
    pub default_strategy: UploadStrategy,
}

impl UploadPolicy {
    fn new(
        allowed: &[&[&str]],
        max_file_size: u64,
        min_part_size: u64,
        key_prefix: &str,
        default_strategy: UploadStrategy,
    ) -> Self {
        Self {
            allowed_mime_types: allowed
                .iter()
                .flat_map(|group| group.iter().map(|t| t.to_string()))
                .collect(),
            max_file_size,
            min_part_size,
            max_part_size: (64 * MIB).max(min_part_size),
            key_prefix: key_prefix.to_string(),
            default_strategy,
        }
    }

    pub fn allows_type(&self, content_type: &str) -> bool {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&essence))
    }

    /// Effective part size for a caller hint: never below the minimum, never above the maximum.
    pub fn effective_part_size(&self, hint: Option<u64>) -> u64 {
        hint.unwrap_or(self.min_part_size)
            .max(self.min_part_size)
            .min(self.max_part_size.max(self.min_part_size))
    }
}

/// Policies for every surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyTable {
    policies: HashMap<UploadSurface, UploadPolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            UploadSurface::Media,
            UploadPolicy::new(
                &[IMAGE_TYPES, VIDEO_TYPES],
                500 * MIB,
                5 * MIB,
                "media",
                UploadStrategy::Presigned,
            ),
        );
        policies.insert(
            UploadSurface::ComplaintAttachment,
            UploadPolicy::new(
                &[IMAGE_TYPES, VIDEO_TYPES, &["application/pdf"]],
                100 * MIB,
                5 * MIB,
                "complaints",
                UploadStrategy::Buffered,
            ),
        );
        policies.insert(
            UploadSurface::EmergencyAudio,
            UploadPolicy::new(
                &[AUDIO_TYPES],
                25 * MIB,
                MIB,
                "emergency-audio",
                UploadStrategy::Buffered,
            ),
        );
        policies.insert(
            UploadSurface::CampaignPhoto,
            UploadPolicy::new(
                &[&["image/jpeg", "image/png", "image/webp"]],
                2 * MIB,
                256 * KIB,
                "campaign-photos",
                UploadStrategy::Buffered,
            ),
        );
        Self { policies }
    }
}

impl PolicyTable {
    /// Override entries of the built-in table. Surfaces absent from `overrides` keep defaults.
    pub fn with_overrides(overrides: HashMap<UploadSurface, UploadPolicy>) -> Self {
        let mut table = Self::default();
        table.policies.extend(overrides);
        table
    }

    pub fn policy(&self, surface: UploadSurface) -> &UploadPolicy {
        // Every surface has an entry: the default table covers all of them and overrides
        // only replace entries.
        &self.policies[&surface]
    }

    /// Largest part any surface accepts; bounds request bodies for buffered parts.
    pub fn largest_part_size(&self) -> u64 {
        self.policies
            .values()
            .map(|p| p.max_part_size.max(p.min_part_size))
            .max()
            .unwrap_or_default()
    }

    pub fn set(&mut self, surface: UploadSurface, policy: UploadPolicy) {
        self.policies.insert(surface, policy);
    }

    /// Check a file against the surface's policy.
    pub fn validate(
        &self,
        filename: &str,
        content_type: &str,
        size: u64,
        surface: UploadSurface,
    ) -> Result<(), PolicyViolation> {
        validate_filename(filename)?;
        let policy = self.policy(surface);
        if !policy.allows_type(content_type) {
            return Err(PolicyViolation::InvalidType {
                content_type: content_type.to_string(),
                surface,
            });
        }
        self.validate_size(size, surface)
    }

    /// Size-only check, used again at completion with the assembled size.
    pub fn validate_size(&self, size: u64, surface: UploadSurface) -> Result<(), PolicyViolation> {
        if size == 0 {
            return Err(PolicyViolation::EmptyFile);
        }
        let max = self.policy(surface).max_file_size;
        if size > max {
            return Err(PolicyViolation::TooLarge { size, max, surface });
        }
        Ok(())
    }
}

fn validate_filename(filename: &str) -> Result<(), PolicyViolation> {
    if filename.trim().is_empty() {
        return Err(PolicyViolation::InvalidFilename("must not be empty".into()));
    }
    if filename.len() > MAX_FILENAME_LEN {
        return Err(PolicyViolation::InvalidFilename(format!(
            "must be at most {} bytes",
            MAX_FILENAME_LEN
        )));
    }
    if filename.chars().any(|c| c.is_control()) {
        return Err(PolicyViolation::InvalidFilename(
            "must not contain control characters".into(),
        ));
    }
    Ok(())
}

/// Reduce a client filename to a safe single path segment for object keys.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
        .trim();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_accepts_video_and_rejects_audio() {
        let table = PolicyTable::default();
        assert!(
            table
                .validate("clip.mp4", "video/mp4", 10 * MIB, UploadSurface::Media)
                .is_ok()
        );
        assert!(matches!(
            table.validate("note.ogg", "audio/ogg", MIB, UploadSurface::Media),
            Err(PolicyViolation::InvalidType { .. })
        ));
    }

    #[test]
    fn emergency_audio_only_takes_audio() {
        let table = PolicyTable::default();
        assert!(
            table
                .validate("note.webm", "audio/webm; codecs=opus", MIB, UploadSurface::EmergencyAudio)
                .is_ok()
        );
        assert!(matches!(
            table.validate("pic.png", "image/png", MIB, UploadSurface::EmergencyAudio),
            Err(PolicyViolation::InvalidType { .. })
        ));
    }

    #[test]
    fn campaign_photos_are_capped_at_two_megabytes() {
        let table = PolicyTable::default();
        assert!(
            table
                .validate("me.jpg", "image/jpeg", 2 * MIB, UploadSurface::CampaignPhoto)
                .is_ok()
        );
        assert_eq!(
            table.validate("me.jpg", "image/jpeg", 2 * MIB + 1, UploadSurface::CampaignPhoto),
            Err(PolicyViolation::TooLarge {
                size: 2 * MIB + 1,
                max: 2 * MIB,
                surface: UploadSurface::CampaignPhoto,
            })
        );
        assert!(matches!(
            table.validate("clip.mp4", "video/mp4", MIB, UploadSurface::CampaignPhoto),
            Err(PolicyViolation::InvalidType { .. })
        ));
    }

    #[test]
    fn empty_files_and_bad_names_are_rejected() {
        let table = PolicyTable::default();
        assert_eq!(
            table.validate("a.png", "image/png", 0, UploadSurface::Media),
            Err(PolicyViolation::EmptyFile)
        );
        assert!(matches!(
            table.validate("  ", "image/png", 1, UploadSurface::Media),
            Err(PolicyViolation::InvalidFilename(_))
        ));
    }

    #[test]
    fn part_size_hint_is_clamped_to_policy() {
        let policy = PolicyTable::default().policy(UploadSurface::Media).clone();
        assert_eq!(policy.effective_part_size(Some(1024)), 5 * MIB);
        assert_eq!(policy.effective_part_size(None), 5 * MIB);
        assert_eq!(policy.effective_part_size(Some(8 * MIB)), 8 * MIB);
        assert_eq!(policy.effective_part_size(Some(u64::MAX)), 64 * MIB);
    }

    #[test]
    fn overrides_replace_only_named_surfaces() {
        let mut custom = PolicyTable::default().policy(UploadSurface::CampaignPhoto).clone();
        custom.max_file_size = 4 * MIB;
        let table =
            PolicyTable::with_overrides(HashMap::from([(UploadSurface::CampaignPhoto, custom)]));
        assert_eq!(table.policy(UploadSurface::CampaignPhoto).max_file_size, 4 * MIB);
        assert_eq!(table.policy(UploadSurface::Media).max_file_size, 500 * MIB);
    }

    #[test]
    fn sanitize_strips_paths_and_odd_characters() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("my clip (1).mp4"), "my_clip__1_.mp4");
        assert_eq!(sanitize_filename(".."), "file");
        assert_eq!(sanitize_filename("C:\\Users\\me\\photo.jpg"), "photo.jpg");
    }
}
