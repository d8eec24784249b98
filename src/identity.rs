//! Loads the daemon's persistent WireGuard server keypair and at-rest
//! peer-key encryption key from `wireguard.state_dir`, generating both on
//! first run. Neither value is ever logged.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use anvil_core::retry::retry;
use anvil_wireguard::keys::generate_keypair;
use base64::Engine as _;
use rand::RngCore;

pub struct ServerIdentity {
    pub public_key: String,
    pub encryption_key: [u8; 32],
}

pub fn load_or_generate(state_dir: &str) -> Result<ServerIdentity> {
    let dir = Path::new(state_dir);
    retry(3, Duration::from_millis(100), "create wireguard state dir", || {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create wireguard state dir {state_dir}"))
    })?;

    let public_key = load_or_generate_server_keypair(dir)?;
    let encryption_key = load_or_generate_encryption_key(dir)?;

    Ok(ServerIdentity {
        public_key,
        encryption_key,
    })
}

fn load_or_generate_server_keypair(dir: &Path) -> Result<String> {
    let private_path = dir.join("server_private_key");
    let public_path = dir.join("server_public_key");

    if public_path.exists() {
        return std::fs::read_to_string(&public_path)
            .map(|s| s.trim().to_string())
            .with_context(|| format!("failed to read {}", public_path.display()));
    }

    let keypair = generate_keypair();
    write_restricted(&private_path, keypair.private_key_b64.as_bytes())?;
    std::fs::write(&public_path, &keypair.public_key_b64)
        .with_context(|| format!("failed to write {}", public_path.display()))?;
    Ok(keypair.public_key_b64)
}

fn load_or_generate_encryption_key(dir: &Path) -> Result<[u8; 32]> {
    let path = dir.join("encryption.key");

    if path.exists() {
        let encoded = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .context("encryption.key is not valid base64")?;
        return bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("encryption.key must decode to 32 bytes"));
    }

    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    write_restricted(&path, base64::engine::general_purpose::STANDARD.encode(key).as_bytes())?;
    Ok(key)
}

#[cfg(unix)]
fn write_restricted(path: &Path, data: &[u8]) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(data)
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(not(unix))]
fn write_restricted(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))
}
