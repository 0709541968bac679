//! DELETE handler (§4.6 step 4). Resolves the target under the upload
//! store if one is configured, else under the effective root, and
//! refuses anything that canonicalizes outside that base directory.

use std::fs;
use std::path::{Path, PathBuf};

pub enum DeleteOutcome {
    Deleted,
    NotFound,
    IoError,
}

pub fn handle_delete(base_dir: &str, target: &str) -> DeleteOutcome {
    let base = PathBuf::from(base_dir);
    let relative = target.trim_start_matches('/');
    let candidate = base.join(relative);

    let Ok(canonical_base) = base.canonicalize() else {
        return DeleteOutcome::NotFound;
    };
    let canonical_target = match candidate.canonicalize() {
        Ok(p) => p,
        Err(e) => {
            return match e.kind() {
                std::io::ErrorKind::NotFound => DeleteOutcome::NotFound,
                _ => DeleteOutcome::IoError,
            };
        }
    };

    if !canonical_target.starts_with(&canonical_base) {
        return DeleteOutcome::NotFound;
    }
    if canonical_target.is_dir() {
        return DeleteOutcome::NotFound;
    }

    match fs::remove_file(&canonical_target) {
        Ok(()) => DeleteOutcome::Deleted,
        Err(e) => match e.kind() {
            std::io::ErrorKind::NotFound => DeleteOutcome::NotFound,
            _ => DeleteOutcome::IoError,
        },
    }
}

#[allow(dead_code)]
fn is_regular_file(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn deletes_file_within_base() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("victim.txt");
        File::create(&file_path).unwrap().write_all(b"x").unwrap();
        let outcome = handle_delete(dir.path().to_str().unwrap(), "/victim.txt");
        assert!(matches!(outcome, DeleteOutcome::Deleted));
        assert!(!file_path.exists());
    }

    #[test]
    fn refuses_traversal_outside_base() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::NamedTempFile::new().unwrap();
        let traversal = format!("/../{}", outside.path().file_name().unwrap().to_str().unwrap());
        // Construct a target that, joined to base, would canonicalize outside it.
        let outcome = handle_delete(dir.path().to_str().unwrap(), &traversal);
        assert!(matches!(outcome, DeleteOutcome::NotFound));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = handle_delete(dir.path().to_str().unwrap(), "/nope.txt");
        assert!(matches!(outcome, DeleteOutcome::NotFound));
    }
}
