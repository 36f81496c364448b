pub mod paths;
pub mod token_store;

pub use paths::ClientPaths;
pub use token_store::{FileTokenStore, MemoryTokenStore, TokenStore};

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::errors::{WalletError, WalletResult};

/// Replace `path` with `bytes` through a sibling `.new` file and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8], owner_only: bool) -> WalletResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| WalletError::StorageError(format!("Invalid path {}", path.display())))?;
    fs::create_dir_all(dir)?;

    let tmp_path = path.with_extension("new");
    {
        let mut file = File::create(&tmp_path)?;
        if owner_only {
            restrict_permissions(&file)?;
        }
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(file: &File) -> WalletResult<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &File) -> WalletResult<()> {
    Ok(())
}
