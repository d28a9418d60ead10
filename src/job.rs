//! Decoding of resize job messages.
//!
//! A job travels as a single comma separated text payload with nine fields in
//! a fixed order:
//!
//! ```text
//! mediaId,largeUri,mediumUri,thumbnailUri,sourceReadToken,sourceDeleteToken,
//! largeWriteToken,mediumWriteToken,thumbnailWriteToken
//! ```
//!
//! There is no escaping, so a comma inside any field changes the field count
//! and the message is rejected as a whole.

use crate::storage::CapabilityToken;
use crate::SizeClass;
use thiserror::Error;

pub const FIELD_COUNT: usize = 9;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobParseError {
    #[error("expected 9 fields, found {0}")]
    FieldCount(usize),

    #[error("field `{0}` is empty")]
    EmptyField(&'static str),

    #[error("media id `{0}` is not an integer")]
    InvalidMediaId(String),

    #[error("field `{field}` is not a valid capability token: {reason}")]
    InvalidToken { field: &'static str, reason: String },
}

/// One value per size class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerSize<T> {
    pub large: T,
    pub medium: T,
    pub thumbnail: T,
}

impl<T> PerSize<T> {
    pub fn get(&self, size: SizeClass) -> &T {
        match size {
            SizeClass::Large => &self.large,
            SizeClass::Medium => &self.medium,
            SizeClass::Thumbnail => &self.thumbnail,
        }
    }
}

/// A fully validated job taken from the job queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizeJob {
    pub media_id: i64,
    pub destinations: PerSize<String>,
    pub source_read: CapabilityToken,
    pub source_delete: CapabilityToken,
    pub destination_write: PerSize<CapabilityToken>,
}

const FIELD_NAMES: [&str; FIELD_COUNT] = [
    "mediaId",
    "largeUri",
    "mediumUri",
    "thumbnailUri",
    "sourceReadToken",
    "sourceDeleteToken",
    "largeWriteToken",
    "mediumWriteToken",
    "thumbnailWriteToken",
];

impl ResizeJob {
    /// Decode a raw queue payload, failing closed on any missing or empty field.
    pub fn decode(payload: &str) -> Result<Self, JobParseError> {
        let fields: Vec<&str> = payload.split(',').map(str::trim).collect();
        if fields.len() != FIELD_COUNT {
            return Err(JobParseError::FieldCount(fields.len()));
        }
        if let Some(idx) = fields.iter().position(|f| f.is_empty()) {
            return Err(JobParseError::EmptyField(FIELD_NAMES[idx]));
        }

        let media_id = fields[0]
            .parse::<i64>()
            .map_err(|_| JobParseError::InvalidMediaId(fields[0].to_string()))?;

        let token = |idx: usize| {
            fields[idx]
                .parse::<CapabilityToken>()
                .map_err(|err| JobParseError::InvalidToken {
                    field: FIELD_NAMES[idx],
                    reason: err.to_string(),
                })
        };

        Ok(ResizeJob {
            media_id,
            destinations: PerSize {
                large: fields[1].to_string(),
                medium: fields[2].to_string(),
                thumbnail: fields[3].to_string(),
            },
            source_read: token(4)?,
            source_delete: token(5)?,
            destination_write: PerSize {
                large: token(6)?,
                medium: token(7)?,
                thumbnail: token(8)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> String {
        [
            "42",
            "https://blobs.test/large/42.jpg",
            "https://blobs.test/medium/42.jpg",
            "https://blobs.test/thumb/42.jpg",
            "https://blobs.test/orig/42?sig=r",
            "https://blobs.test/orig/42?sig=d",
            "https://blobs.test/large/42.jpg?sig=wl",
            "https://blobs.test/medium/42.jpg?sig=wm",
            "https://blobs.test/thumb/42.jpg?sig=wt",
        ]
        .join(",")
    }

    #[test]
    fn decodes_all_nine_fields() {
        let job = ResizeJob::decode(&payload()).unwrap();
        assert_eq!(job.media_id, 42);
        assert_eq!(job.destinations.medium, "https://blobs.test/medium/42.jpg");
        assert_eq!(
            job.destination_write.get(SizeClass::Thumbnail).to_string(),
            "https://blobs.test/thumb/42.jpg?sig=wt"
        );
        assert_eq!(job.source_delete.to_string(), "https://blobs.test/orig/42?sig=d");
    }

    #[test]
    fn rejects_one_field_short() {
        let short = payload().rsplit_once(',').unwrap().0.to_string();
        assert_eq!(ResizeJob::decode(&short), Err(JobParseError::FieldCount(8)));
    }

    #[test]
    fn rejects_embedded_comma() {
        let extra = format!("{},trailing", payload());
        assert_eq!(ResizeJob::decode(&extra), Err(JobParseError::FieldCount(10)));
    }

    #[test]
    fn rejects_empty_field() {
        let blank = payload().replacen("https://blobs.test/medium/42.jpg,", ",", 1);
        assert_eq!(
            ResizeJob::decode(&blank),
            Err(JobParseError::EmptyField("mediumUri"))
        );
    }

    #[test]
    fn rejects_non_numeric_media_id() {
        let bad = payload().replacen("42,", "abc,", 1);
        assert_eq!(
            ResizeJob::decode(&bad),
            Err(JobParseError::InvalidMediaId("abc".into()))
        );
    }

    #[test]
    fn rejects_token_with_whitespace() {
        let bad = payload().replacen("https://blobs.test/orig/42?sig=r", "r Tok", 1);
        assert!(matches!(
            ResizeJob::decode(&bad),
            Err(JobParseError::InvalidToken {
                field: "sourceReadToken",
                ..
            })
        ));
    }
}
