pub mod model;
pub mod writer;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::model::{AppConfig, TunnelDefinition};
use crate::config::writer::atomic_write;

/// Return the XDG-compliant config file path.
///
/// - Linux/macOS: ~/.config/burrow/config.toml
/// - Windows: %APPDATA%\burrow\config.toml
pub fn config_path() -> PathBuf {
    let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
    config_dir.join("burrow").join("config.toml")
}

/// Load config with an optional custom path override.
/// Priority: custom_path → XDG default.
pub fn load_with_override(custom_path: Option<&str>) -> Result<AppConfig> {
    let path = resolve_config_path(custom_path);
    load_from(&path)
}

/// Resolve the effective config path from an optional override.
pub fn resolve_config_path(custom_path: Option<&str>) -> PathBuf {
    match custom_path {
        Some(p) => PathBuf::from(shellexpand::tilde(p).to_string()),
        None => config_path(),
    }
}

/// Load config from a specific path. A missing file yields the defaults.
pub fn load_from(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        info!(path = %path.display(), "No config file found, using defaults");
        return Ok(AppConfig::default());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    let inline = tunnels_with_inline_secrets(&config.tunnels);
    if let Some(mode) = loose_mode(path).filter(|_| inline > 0) {
        warn!(
            path = %path.display(),
            mode = format!("{mode:o}"),
            tunnels = inline,
            "Config holds inline secrets but is readable by other users (expected 600)"
        );
    }
    warn_duplicate_names(&config.tunnels);

    info!(
        path = %path.display(),
        tunnels = config.tunnels.len(),
        transport = ?config.settings.transport,
        "Loaded config"
    );
    Ok(config)
}

/// Save config to a specific path via atomic write.
///
/// Passwords, inline keys and passphrases are not written back.
pub fn save_to(config: &AppConfig, path: &Path) -> Result<()> {
    atomic_write(config, path)
}

/// Warn if any tunnels share the same name. Duplicates are still loaded, but
/// `burrow up NAME` only matches the first.
fn warn_duplicate_names(tunnels: &[TunnelDefinition]) {
    let mut seen = HashSet::new();
    for t in tunnels.iter().filter(|t| !seen.insert(t.name.as_str())) {
        warn!(name = %t.name, "Duplicate tunnel name in config");
    }
}

fn tunnels_with_inline_secrets(tunnels: &[TunnelDefinition]) -> usize {
    tunnels
        .iter()
        .filter(|t| {
            let c = &t.config.credentials;
            c.password.is_some() || c.private_key.is_some() || c.passphrase.is_some()
        })
        .count()
}

/// Permission bits, when group or others can access the file.
#[cfg(unix)]
fn loose_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(path).ok()?.permissions().mode() & 0o777;
    (mode & 0o077 != 0).then_some(mode)
}

#[cfg(not(unix))]
fn loose_mode(_path: &Path) -> Option<u32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{Credentials, TransportKind, TunnelConfig};

    #[test]
    fn test_config_path_contains_burrow() {
        let path = config_path();
        assert!(path.ends_with("burrow/config.toml"));
    }

    #[test]
    fn test_load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let config = load_from(&path).unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(!path.exists());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.settings.transport = TransportKind::Simulated;
        config.tunnels.push(TunnelDefinition {
            name: "postgres".into(),
            config: TunnelConfig {
                host: "bastion.example.com".into(),
                port: 2222,
                username: Some("deploy".into()),
                credentials: Credentials {
                    identity_file: Some("~/.ssh/id_ed25519".into()),
                    ..Credentials::default()
                },
                local_port: Some(5433),
                remote_host: "db.internal".into(),
                remote_port: 5432,
                keep_alive: false,
                connect_timeout_secs: 30,
            },
        });

        save_to(&config, &path).unwrap();
        let loaded = load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_save_drops_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.tunnels.push(TunnelDefinition {
            name: "redis".into(),
            config: TunnelConfig {
                host: "cache.example.com".into(),
                port: 22,
                username: None,
                credentials: Credentials {
                    password: Some("s3cret".into()),
                    ..Credentials::default()
                },
                local_port: None,
                remote_host: "localhost".into(),
                remote_port: 6379,
                keep_alive: true,
                connect_timeout_secs: 15,
            },
        });

        save_to(&config, &path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.contains("s3cret"));
        assert!(content.contains("cache.example.com"));
    }

    #[test]
    fn test_load_invalid_toml_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[[tunnels]\nname = ").unwrap();
        let err = load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_resolve_config_path_override() {
        let path = resolve_config_path(Some("/tmp/burrow-test.toml"));
        assert_eq!(path, PathBuf::from("/tmp/burrow-test.toml"));
    }

    #[test]
    fn test_resolve_config_path_expands_tilde() {
        let path = resolve_config_path(Some("~/burrow.toml"));
        assert!(!path.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_inline_secret_count() {
        let content = r#"
[[tunnels]]
name = "a"
host = "h"
password = "pw"
remote_host = "db"
remote_port = 5432

[[tunnels]]
name = "b"
host = "h"
identity_file = "~/.ssh/id_ed25519"
remote_host = "db"
remote_port = 5432
"#;
        let config: AppConfig = toml::from_str(content).unwrap();
        assert_eq!(tunnels_with_inline_secrets(&config.tunnels), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_loose_mode_detection() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "").unwrap();

        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        assert_eq!(loose_mode(&path), Some(0o644));
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        assert_eq!(loose_mode(&path), None);
    }
}
