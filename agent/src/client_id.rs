//! Persisted client identity at `$HOME/.prod/id`.
//!
//! Created on first run as 32 lowercase hex characters from a CSPRNG; the
//! directory and file get conservative but not secret-grade permissions
//! (0755 / 0644) since the id is not itself a credential — it only groups
//! a developer's tunnels for idempotent re-registration.

use anyhow::{Context, Result};
use rand::RngCore;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

fn prod_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".prod"))
}

fn generate_hex_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Loads the persisted client id, creating it (and its directory) on first
/// run. Trailing whitespace on an existing file is trimmed before use.
pub fn load_or_create() -> Result<String> {
    let dir = prod_dir()?;
    let path = dir.join("id");

    if let Ok(existing) = fs::read_to_string(&path) {
        return Ok(existing.trim_end().to_string());
    }

    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    #[cfg(unix)]
    fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;

    let id = generate_hex_id();
    let mut file = fs::File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    file.write_all(id.as_bytes())?;
    #[cfg(unix)]
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_is_32_lowercase_hex_chars() {
        let id = generate_hex_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
