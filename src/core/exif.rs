use chrono::{DateTime, NaiveDateTime, Utc};
use exif::{In, Reader, Tag, Value};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Resolves when a photo was taken, in milliseconds since the Unix epoch.
pub trait CaptureTimeSource: Send + Sync {
    /// Returns 0 when nothing can be determined.
    fn captured_at(&self, path: &Path) -> i64;
}

/// EXIF `DateTimeOriginal`, then `DateTime`, then the file modification time.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExifCaptureTime;

impl CaptureTimeSource for ExifCaptureTime {
    fn captured_at(&self, path: &Path) -> i64 {
        if let Some(taken) = exif_datetime(path) {
            return taken.timestamp_millis();
        }
        log::debug!("No EXIF capture time for {}, using mtime", path.display());
        modified_millis(path).unwrap_or(0)
    }
}

fn exif_datetime(path: &Path) -> Option<DateTime<Utc>> {
    let file = File::open(path).ok()?;
    let mut buf_reader = BufReader::new(file);
    let exif = Reader::new().read_from_container(&mut buf_reader).ok()?;

    [Tag::DateTimeOriginal, Tag::DateTime]
        .into_iter()
        .filter_map(|tag| exif.get_field(tag, In::PRIMARY))
        .filter_map(|field| ascii_value(&field.value))
        .find_map(|raw| parse_exif_datetime(&raw))
}

fn ascii_value(value: &Value) -> Option<String> {
    match value {
        Value::Ascii(vec) => vec.first().map(|ascii| {
            String::from_utf8_lossy(ascii)
                .trim_end_matches('\0')
                .to_string()
        }),
        _ => None,
    }
}

/// Parse the EXIF "YYYY:MM:DD HH:MM:SS" format, interpreted as UTC.
pub fn parse_exif_datetime(raw: &str) -> Option<DateTime<Utc>> {
    match NaiveDateTime::parse_from_str(raw.trim(), "%Y:%m:%d %H:%M:%S") {
        Ok(dt) => Some(dt.and_utc()),
        Err(_) => {
            log::warn!("Failed to parse EXIF datetime: {}", raw);
            None
        }
    }
}

fn modified_millis(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(since_epoch.as_millis()).ok()
}
