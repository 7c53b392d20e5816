//! Write-then-rename for stage outputs.

use std::fs;
use std::path::{Path, PathBuf};

use terrasse_pipeline::GridError;

/// Sibling of `path` that receives the output while it is being written.
#[must_use]
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(ToOwned::to_owned).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Run `write` against a temporary sibling of `path`, then rename it into
/// place. On failure the temporary file is removed and `path` is left as
/// it was.
///
/// # Errors
///
/// Returns the error of `write`, or [`GridError::Backend`] when the
/// rename fails.
pub fn write_atomically<T, E, F>(path: &Path, write: F) -> Result<T, E>
where
    E: From<GridError>,
    F: FnOnce(&Path) -> Result<T, E>,
{
    let tmp = tmp_path(path);
    match write(&tmp) {
        Ok(value) => {
            fs::rename(&tmp, path).map_err(|e| {
                GridError::Backend(format!(
                    "renaming {} to {}: {e}",
                    tmp.display(),
                    path.display()
                ))
            })?;
            Ok(value)
        }
        Err(e) => {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                log::debug!("could not remove {}: {cleanup}", tmp.display());
            }
            Err(e)
        }
    }
}
