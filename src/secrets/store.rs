//! Encrypted settings files on disk.

use std::path::Path;
use std::process::Command;

use tracing::{debug, info};
use zeroize::Zeroizing;

use super::{cipher, SecretsError, HEADER};
use crate::fsio::write_atomic;

const PRIVATE_MODE: u32 = 0o600;

pub fn is_encrypted(content: &str) -> bool {
    content.lines().next().map(str::trim_end) == Some(HEADER)
}

fn read(path: &Path) -> Result<Zeroizing<String>, SecretsError> {
    std::fs::read_to_string(path)
        .map(Zeroizing::new)
        .map_err(|e| SecretsError::io(path, e))
}

fn decrypt_content(password: &str, content: &str) -> Result<Zeroizing<String>, SecretsError> {
    let body = content.lines().skip(1).collect::<Vec<_>>().join("\n");
    let plain = cipher::open(password, &body)?;
    String::from_utf8(plain.to_vec())
        .map(Zeroizing::new)
        .map_err(|_| SecretsError::Payload("decrypted settings are not UTF-8".to_string()))
}

fn encrypt_content(password: &str, plain: &str) -> Result<String, SecretsError> {
    Ok(format!("{HEADER}\n{}", cipher::seal(password, plain.as_bytes())?))
}

/// Read the settings text, decrypting it when the file carries the header.
/// A password is only required for encrypted files.
pub fn load_settings(path: &Path, password: Option<&str>) -> Result<Zeroizing<String>, SecretsError> {
    let content = read(path)?;
    if !is_encrypted(&content) {
        debug!(path = %path.display(), "settings file is plain text");
        return Ok(content);
    }
    let password = password.ok_or(SecretsError::MissingPassword)?;
    decrypt_content(password, &content)
}

pub fn encrypt_file(path: &Path, password: &str) -> Result<(), SecretsError> {
    let content = read(path)?;
    if is_encrypted(&content) {
        return Err(SecretsError::AlreadyEncrypted(path.to_path_buf()));
    }
    let sealed = encrypt_content(password, &content)?;
    write_atomic(path, sealed.as_bytes(), Some(PRIVATE_MODE)).map_err(|e| SecretsError::io(path, e))?;
    info!(path = %path.display(), "settings encrypted");
    Ok(())
}

pub fn decrypt_file(path: &Path, password: &str) -> Result<(), SecretsError> {
    let content = read(path)?;
    if !is_encrypted(&content) {
        return Err(SecretsError::NotEncrypted(path.to_path_buf()));
    }
    let plain = decrypt_content(password, &content)?;
    write_atomic(path, plain.as_bytes(), Some(PRIVATE_MODE)).map_err(|e| SecretsError::io(path, e))?;
    info!(path = %path.display(), "settings decrypted");
    Ok(())
}

/// Open an encrypted settings file in `$EDITOR` (default `nano`) and
/// re-encrypt whatever the editor saved.
pub fn edit_file(path: &Path, password: &str) -> Result<(), SecretsError> {
    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "nano".to_string());
    edit_with(path, password, &editor)
}

fn edit_with(path: &Path, password: &str, editor: &str) -> Result<(), SecretsError> {
    let content = read(path)?;
    if !is_encrypted(&content) {
        return Err(SecretsError::NotEncrypted(path.to_path_buf()));
    }
    let plain = decrypt_content(password, &content)?;

    let scratch = tempfile::Builder::new()
        .prefix("saber-edit-")
        .suffix(".toml")
        .tempfile()
        .map_err(|e| SecretsError::io(path, e))?;
    write_atomic(scratch.path(), plain.as_bytes(), Some(PRIVATE_MODE))
        .map_err(|e| SecretsError::io(scratch.path(), e))?;

    let status = Command::new(editor)
        .arg(scratch.path())
        .status()
        .map_err(|e| SecretsError::io(Path::new(editor), e))?;
    if !status.success() {
        return Err(SecretsError::Editor {
            editor: editor.to_string(),
            status: status.to_string(),
        });
    }

    let edited = read(scratch.path())?;
    let sealed = encrypt_content(password, &edited)?;
    write_atomic(path, sealed.as_bytes(), Some(PRIVATE_MODE)).map_err(|e| SecretsError::io(path, e))?;
    info!(path = %path.display(), "settings updated");
    Ok(())
}
