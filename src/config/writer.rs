use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

use crate::config::model::AppConfig;

/// Serialize the config and replace `path` with it in one rename.
pub fn atomic_write(config: &AppConfig, path: &Path) -> Result<()> {
    let toml_str = toml::to_string_pretty(config).context("Failed to serialize config to TOML")?;
    write_private(path, toml_str.as_bytes())
}

/// Write owner-only file contents via tempfile-then-rename.
///
/// Used for the config file and for generated private keys. The temp file is
/// created next to `path` so the rename never crosses filesystems, and gets
/// its 0600 mode before any content is visible under the final name.
pub fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

    let mut temp_file = NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temporary file in {}", parent.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(temp_file.path(), fs::Permissions::from_mode(0o600))
            .context("Failed to restrict temporary file permissions")?;
    }

    temp_file
        .write_all(contents)
        .and_then(|()| temp_file.as_file().sync_all())
        .context("Failed to write temporary file")?;

    temp_file
        .persist(path)
        .with_context(|| format!("Failed to move file into place: {}", path.display()))?;
    Ok(())
}
