//! Password handling and at-rest encryption of the settings file.

pub mod cipher;
pub mod store;

use std::path::{Path, PathBuf};

use thiserror::Error;
use zeroize::Zeroizing;

pub use store::{decrypt_file, edit_file, encrypt_file, is_encrypted, load_settings};

/// Environment variable consulted when no `--password` is given.
pub const PASSWORD_ENV: &str = "SABER_PASSWORD";

/// First line of every encrypted settings file.
pub const HEADER: &str = "# MANAGED BY saber #";

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("no password given (use --password or {PASSWORD_ENV})")]
    MissingPassword,

    #[error("wrong password or corrupted file")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("{} is not encrypted", .0.display())]
    NotEncrypted(PathBuf),

    #[error("{} is already encrypted", .0.display())]
    AlreadyEncrypted(PathBuf),

    #[error("invalid encrypted payload: {0}")]
    Payload(String),

    #[error("editor `{editor}` exited with {status}")]
    Editor { editor: String, status: String },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SecretsError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        SecretsError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Password used for settings encryption.
pub type Password = Zeroizing<String>;

/// Resolve the password from the explicit argument, then [`PASSWORD_ENV`].
///
/// A value naming an existing file is replaced by that file's contents.
pub fn resolve_password(explicit: Option<&str>) -> Result<Password, SecretsError> {
    let raw = match explicit {
        Some(value) => Zeroizing::new(value.to_string()),
        None => match std::env::var(PASSWORD_ENV) {
            Ok(value) => Zeroizing::new(value.trim().to_string()),
            Err(_) => return Err(SecretsError::MissingPassword),
        },
    };
    from_value_or_file(raw)
}

fn from_value_or_file(raw: Password) -> Result<Password, SecretsError> {
    let candidate = Path::new(raw.as_str());
    if !raw.is_empty() && candidate.is_file() {
        let content = Zeroizing::new(
            std::fs::read_to_string(candidate).map_err(|e| SecretsError::io(candidate, e))?,
        );
        let password = Zeroizing::new(content.trim_end_matches(['\r', '\n']).to_string());
        if password.is_empty() {
            return Err(SecretsError::MissingPassword);
        }
        return Ok(password);
    }
    if raw.is_empty() {
        return Err(SecretsError::MissingPassword);
    }
    Ok(raw)
}
