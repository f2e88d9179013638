use anyhow::Result;
use log::{debug, error};
use std::path::Path;
use tokio::fs;

/// Asynchronously ensures that a directory exists, creating it if it does not.
/// This function is idempotent.
pub async fn ensure_directory_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() || path.exists() {
        return Ok(());
    }
    if let Err(e) = fs::create_dir_all(path).await {
        error!("Failed to create directory at {:?}: {}", path, e);
        return Err(e.into());
    }
    debug!("Created directory at: {:?}", path);
    Ok(())
}
