//! Key files.
//!
//! A private key file holds the base64 Ed25519 seed on one line. `keygen`
//! writes the matching base64 public key next to it with a `.pub` suffix,
//! ready to be pasted into the host's user directory.

use std::io::Write;
use std::path::{Path, PathBuf};

use admin_core::auth::Ed25519Signer;

use crate::error::Result;

/// Path of the public key written next to `private`.
pub fn public_key_path(private: &Path) -> PathBuf {
    let mut name = private.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

pub fn load_signer(path: &Path) -> Result<Ed25519Signer> {
    let seed = std::fs::read_to_string(path)?;
    Ok(Ed25519Signer::from_base64(&seed)?)
}

/// Generate a key pair and write both halves.
///
/// Refuses to replace an existing private key unless `force` is set.
pub fn generate_key_pair(path: &Path, force: bool) -> Result<Ed25519Signer> {
    let signer = Ed25519Signer::generate();

    let mut options = std::fs::OpenOptions::new();
    options.write(true);
    if force {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    writeln!(file, "{}", signer.seed_base64())?;
    std::fs::write(public_key_path(path), format!("{}\n", signer.public_key_base64()))?;
    Ok(signer)
}
