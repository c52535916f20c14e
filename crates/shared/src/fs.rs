use std::path::Path;

use crate::error::CommonError;

/// Write-to-temp then rename, with the temp file in the target's directory
/// so the rename never crosses filesystems. Readers see either the old or
/// the new contents, never a torn write.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), CommonError> {
    let parent = path.parent().ok_or_else(|| {
        CommonError::validation(format!("path '{}' has no parent directory", path.display()))
    })?;
    tokio::fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let tmp = parent.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
