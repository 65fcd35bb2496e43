//! Segment naming and on-disk record framing
//!
//! A segment is `segment-<seq>.wal` with `seq` zero-padded so plain
//! lexicographic listing matches numeric order. Records are framed as a
//! 4-byte little-endian length followed by that many bytes of JSON payload.
//! Nothing else lives in a segment; frames are strictly appended.

use crate::record::LogRecord;
use std::io::{self, Read};
use std::path::Path;

/// Upper bound on a single frame; larger lengths mean a corrupt prefix.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// WAL-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("wal directory unusable: {0}")]
    Directory(String),
    #[error("frame length {0} exceeds the frame cap")]
    FrameTooLarge(usize),
}

/// File name for a segment sequence number.
pub fn segment_file_name(seq: u64) -> String {
    format!("segment-{seq:06}.wal")
}

/// Parse the sequence number out of a segment file name.
///
/// Returns `None` for anything that is not a well-formed segment name, so
/// stray files in the WAL directory are ignored rather than deleted.
pub fn parse_segment_seq(name: &str) -> Option<u64> {
    let digits = name.strip_prefix("segment-")?.strip_suffix(".wal")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// List `(seq, path)` pairs for every segment in `dir`, ordered by sequence.
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, std::path::PathBuf)>, WalError> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(seq) = parse_segment_seq(name) {
            segments.push((seq, path));
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

/// Serialize a record into a length-prefixed frame.
pub fn encode_frame(record: &LogRecord) -> Result<Vec<u8>, WalError> {
    let payload = serde_json::to_vec(record)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(WalError::FrameTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Read one frame payload from `reader`.
///
/// `Ok(None)` marks a clean end of segment. A torn length prefix, an
/// implausible length or a short payload read all surface as errors; the
/// caller treats them as the end of that segment's usable data.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, WalError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(WalError::Io(e)),
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WalError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_record() -> LogRecord {
        LogRecord {
            timestamp: Utc::now(),
            level: "info".to_string(),
            message: "frame me".to_string(),
            service: "svc".to_string(),
            project_id: 1,
            data: None,
            segment_id: 0,
        }
    }

    #[test]
    fn segment_names_sort_lexicographically() {
        let names: Vec<String> = [1u64, 9, 10, 99, 100, 12345]
            .iter()
            .map(|s| segment_file_name(*s))
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn parse_rejects_foreign_files() {
        assert_eq!(parse_segment_seq("segment-000007.wal"), Some(7));
        assert_eq!(parse_segment_seq("segment-.wal"), None);
        assert_eq!(parse_segment_seq("segment-00a007.wal"), None);
        assert_eq!(parse_segment_seq("checkpoint-000001.wal"), None);
        assert_eq!(parse_segment_seq("segment-000001.tmp"), None);
    }

    #[test]
    fn frame_roundtrip() {
        let record = sample_record();
        let frame = encode_frame(&record).unwrap();

        let mut cursor = std::io::Cursor::new(frame);
        let payload = read_frame(&mut cursor).unwrap().unwrap();
        let decoded: LogRecord = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decoded.message, record.message);

        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn torn_length_prefix_reads_as_end() {
        let mut cursor = std::io::Cursor::new(vec![0x05, 0x00]);
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn implausible_length_is_an_error() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(u32::MAX).to_le_bytes());
        let mut cursor = std::io::Cursor::new(frame);
        assert!(matches!(
            read_frame(&mut cursor),
            Err(WalError::FrameTooLarge(_))
        ));
    }
}
