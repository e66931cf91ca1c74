//! Token signing keys.
//!
//! Keys are stored as base64 text: `<prefix>.secret` holds the 32-byte
//! Ed25519 seed, `<prefix>.pub` the 32-byte verifying key.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{SigningKey, VerifyingKey};

use super::AuthorizationError;

pub fn generate_signing_key() -> SigningKey {
    let mut rng = rand::rngs::OsRng;
    SigningKey::generate(&mut rng)
}

/// Write a fresh key pair and return `(secret_path, public_path)`.
///
/// The secret file is restricted to 0o600 on Unix.
pub fn write_key_pair(output_prefix: &str) -> Result<(PathBuf, PathBuf), AuthorizationError> {
    let signing_key = generate_signing_key();
    let secret_path = PathBuf::from(format!("{output_prefix}.secret"));
    let pub_path = PathBuf::from(format!("{output_prefix}.pub"));

    std::fs::write(&secret_path, BASE64.encode(signing_key.to_bytes()))
        .map_err(|e| key_error("writing", &secret_path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&secret_path, perms)
            .map_err(|e| key_error("restricting", &secret_path, e))?;
    }

    std::fs::write(&pub_path, BASE64.encode(signing_key.verifying_key().to_bytes()))
        .map_err(|e| key_error("writing", &pub_path, e))?;
    Ok((secret_path, pub_path))
}

fn key_error(action: &str, path: &Path, err: impl std::fmt::Display) -> AuthorizationError {
    AuthorizationError::Key(format!("{action} '{}': {err}", path.display()))
}

fn read_key_bytes(path: &Path) -> Result<[u8; 32], AuthorizationError> {
    let contents = std::fs::read_to_string(path).map_err(|e| key_error("reading", path, e))?;
    let bytes = BASE64
        .decode(contents.trim())
        .map_err(|e| key_error("decoding", path, e))?;
    bytes.try_into().map_err(|_| {
        AuthorizationError::Key(format!(
            "invalid key length in '{}': expected 32 bytes",
            path.display()
        ))
    })
}

/// Read a `.secret` file written by [`write_key_pair`].
pub fn read_signing_key(path: &Path) -> Result<SigningKey, AuthorizationError> {
    Ok(SigningKey::from_bytes(&read_key_bytes(path)?))
}

/// Read a `.pub` file written by [`write_key_pair`].
pub fn read_verifying_key(path: &Path) -> Result<VerifyingKey, AuthorizationError> {
    VerifyingKey::from_bytes(&read_key_bytes(path)?)
        .map_err(|e| key_error("parsing", path, e))
}

/// Short hex fingerprint (first 8 bytes of the verifying key).
pub fn key_fingerprint(key: &VerifyingKey) -> String {
    key.to_bytes()[..8]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
