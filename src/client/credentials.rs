//! The `~/.reqbouncer/config` credentials file.
//!
//! Plain `key=value` lines, no escaping. The `REQBOUNCER_SECRET_TOKEN`
//! environment variable takes precedence over the stored token.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, anyhow};

/// Environment variable overriding the stored access token.
pub const SECRET_TOKEN_ENV: &str = "REQBOUNCER_SECRET_TOKEN";

/// Resolves `~/.reqbouncer/config`.
pub fn config_file_path() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".reqbouncer").join("config"))
        .ok_or_else(|| anyhow!("unable to determine home directory"))
}

/// Reads `key` from the credentials file. A missing file or key is `None`.
pub fn read_key(path: &Path, key: &str) -> Result<Option<String>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };

    let prefix = format!("{key}=");
    Ok(contents
        .lines()
        .find_map(|line| line.strip_prefix(&prefix).map(str::to_string)))
}

/// Writes the credentials file, replacing any previous contents.
pub fn write_credentials(path: &Path, server_host: &str, access_token: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(
        path,
        format!("server_host={server_host}\naccess_token={access_token}\n"),
    )
    .with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("reqbouncer-test-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_write_then_read() {
        let path = scratch_file("roundtrip");
        write_credentials(&path, "alice.example.com:443", "tok_abc").unwrap();

        assert_eq!(
            read_key(&path, "server_host").unwrap().as_deref(),
            Some("alice.example.com:443")
        );
        assert_eq!(
            read_key(&path, "access_token").unwrap().as_deref(),
            Some("tok_abc")
        );
        assert_eq!(read_key(&path, "client_id").unwrap(), None);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_file_is_none() {
        let path = scratch_file("missing");
        assert_eq!(read_key(&path, "access_token").unwrap(), None);
    }

    #[test]
    fn test_key_must_match_whole_prefix() {
        let path = scratch_file("prefix");
        std::fs::write(&path, "access_token_backup=no\naccess_token=yes\n").unwrap();
        assert_eq!(read_key(&path, "access_token").unwrap().as_deref(), Some("yes"));
        std::fs::remove_file(&path).ok();
    }
}
