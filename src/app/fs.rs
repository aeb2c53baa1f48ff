use std::fs;
use std::path::Path;

use tracing::debug;

use crate::app::error::AppError;

/// Removes `path` with everything in it and recreates it empty.
pub fn clean_directory(path: &Path, trace_id: &str) -> Result<(), AppError> {
    if path.exists() {
        fs::remove_dir_all(path)
            .map_err(|err| AppError::io(format!("Failed to clean {}: {err}", path.display()), trace_id))?;
    }
    fs::create_dir_all(path)
        .map_err(|err| AppError::io(format!("Failed to create {}: {err}", path.display()), trace_id))?;
    debug!(trace_id = %trace_id, path = %path.display(), "cleaned directory");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_directory_empties_existing_dir() {
        let dir = tempfile::tempdir().expect("tmp");
        let target = dir.path().join("results");
        fs::create_dir_all(target.join("A")).expect("mkdir");
        fs::write(target.join("A").join("results.json"), "{}").expect("write");

        clean_directory(&target, "t").expect("clean");
        assert!(target.is_dir());
        assert_eq!(fs::read_dir(&target).expect("read").count(), 0);
    }

    #[test]
    fn clean_directory_creates_missing_dir() {
        let dir = tempfile::tempdir().expect("tmp");
        let target = dir.path().join("a").join("b");
        clean_directory(&target, "t").expect("clean");
        assert!(target.is_dir());
    }

    #[test]
    fn clean_directory_reports_io_error_for_file() {
        let dir = tempfile::tempdir().expect("tmp");
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").expect("write");
        let err = clean_directory(&blocker.join("child"), "t").unwrap_err();
        assert_eq!(err.code, crate::app::error::ERR_IO);
    }
}
