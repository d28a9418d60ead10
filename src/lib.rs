use std::fmt;

pub mod db;
pub mod job;
pub mod notify;
pub mod queue;
pub mod resize;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use job::{JobParseError, ResizeJob};

/// Output variants produced for every photo.
///
/// The discriminant is the target length of the longer image side in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    Large = 500,
    Medium = 300,
    Thumbnail = 64,
}

impl SizeClass {
    /// Order in which variants are produced for a job.
    pub const PROCESSING_ORDER: [SizeClass; 3] =
        [SizeClass::Thumbnail, SizeClass::Medium, SizeClass::Large];

    pub fn target(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SizeClass::Large => "large",
            SizeClass::Medium => "medium",
            SizeClass::Thumbnail => "thumbnail",
        };
        f.write_str(name)
    }
}

/// Payload appended to the status queue once a photo's variants are reported.
pub fn status_payload(media_id: i64) -> String {
    media_id.to_string()
}
