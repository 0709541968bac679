//! POST-to-upload-store handler (§4.6 step 4, §4.6 "Upload filename").
//! Uploads are raw POST bodies written verbatim to a single file —
//! multipart/form-data parsing is out of scope.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub enum UploadOutcome {
    Created { filename: String },
    Overwritten { filename: String },
    IoError,
}

/// Writes `body` under `store_dir`, deriving the filename from the last
/// segment of `target_after_location` (the request target with the
/// matched location prefix stripped).
pub fn write_upload(store_dir: &str, target_after_location: &str, body: &[u8]) -> UploadOutcome {
    let filename = sanitize_filename(target_after_location);
    let path = PathBuf::from(store_dir).join(&filename);
    let existed = path.exists();

    match fs::write(&path, body) {
        Ok(()) if existed => UploadOutcome::Overwritten { filename },
        Ok(()) => UploadOutcome::Created { filename },
        Err(_) => UploadOutcome::IoError,
    }
}

fn sanitize_filename(target_after_location: &str) -> String {
    let last_segment = target_after_location
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("");

    let cleaned: String = last_segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() || target_after_location.ends_with('/') {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        format!("upload-{}-{}.bin", now.as_secs(), now.subsec_micros())
    } else {
        cleaned
    }
}

#[allow(dead_code)]
fn path_exists(p: &Path) -> bool {
    p.exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_new_file_as_created() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = write_upload(dir.path().to_str().unwrap(), "/hello.txt", b"hello");
        match outcome {
            UploadOutcome::Created { filename } => assert_eq!(filename, "hello.txt"),
            _ => panic!("expected Created"),
        }
        assert_eq!(fs::read(dir.path().join("hello.txt")).unwrap(), b"hello");
    }

    #[test]
    fn overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("dup.txt"), b"old").unwrap();
        let outcome = write_upload(dir.path().to_str().unwrap(), "/dup.txt", b"new");
        assert!(matches!(outcome, UploadOutcome::Overwritten { .. }));
        assert_eq!(fs::read(dir.path().join("dup.txt")).unwrap(), b"new");
    }

    #[test]
    fn generates_unique_name_for_trailing_slash() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = write_upload(dir.path().to_str().unwrap(), "/", b"x");
        match outcome {
            UploadOutcome::Created { filename } => assert!(filename.starts_with("upload-")),
            _ => panic!("expected Created"),
        }
    }

    #[test]
    fn sanitizes_unsafe_characters() {
        assert_eq!(sanitize_filename("/a b$c.txt"), "a_b_c.txt");
    }
}
