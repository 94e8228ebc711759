//! Calling surfaces and the transport strategies an upload can use.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The part of the application an upload originates from.
///
/// Each surface carries its own policy (allowed types, size ceilings, part sizing)
/// and its own object-key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadSurface {
    /// General media library (images and video).
    Media,
    /// Attachments on citizen complaints.
    ComplaintAttachment,
    /// Recorded voice notes for emergency reports.
    EmergencyAudio,
    /// Supporter photos for campaign pages.
    CampaignPhoto,
}

impl UploadSurface {
    pub const ALL: [UploadSurface; 4] = [
        UploadSurface::Media,
        UploadSurface::ComplaintAttachment,
        UploadSurface::EmergencyAudio,
        UploadSurface::CampaignPhoto,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadSurface::Media => "media",
            UploadSurface::ComplaintAttachment => "complaint_attachment",
            UploadSurface::EmergencyAudio => "emergency_audio",
            UploadSurface::CampaignPhoto => "campaign_photo",
        }
    }
}

impl fmt::Display for UploadSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadSurface {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UploadSurface::ALL
            .into_iter()
            .find(|surface| surface.as_str() == s)
            .ok_or_else(|| format!("unknown upload surface `{}`", s))
    }
}

/// How part bytes travel to object storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStrategy {
    /// Client writes each part straight to storage through a pre-signed URL;
    /// the server only finalizes the storage-side multipart upload.
    Presigned,
    /// Client sends parts to the server, which holds them until completion and
    /// writes the assembled object with a single put.
    Buffered,
}

impl UploadStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStrategy::Presigned => "presigned",
            UploadStrategy::Buffered => "buffered",
        }
    }
}

impl fmt::Display for UploadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "presigned" => Ok(UploadStrategy::Presigned),
            "buffered" => Ok(UploadStrategy::Buffered),
            other => Err(format!("unknown upload strategy `{}`", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_names_parse_back() {
        for surface in UploadSurface::ALL {
            assert_eq!(surface.as_str().parse::<UploadSurface>(), Ok(surface));
        }
        assert!("profile".parse::<UploadSurface>().is_err());
    }

    #[test]
    fn surface_serializes_as_snake_case() {
        let json = serde_json::to_string(&UploadSurface::EmergencyAudio).unwrap();
        assert_eq!(json, "\"emergency_audio\"");
    }
}
