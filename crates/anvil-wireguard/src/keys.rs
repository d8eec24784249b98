use base64::Engine as _;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// A Curve25519 keypair, base64-encoded the way `wg genkey`/`wg pubkey` emit them.
pub struct Keypair {
    pub private_key_b64: String,
    pub public_key_b64: String,
}

impl Drop for Keypair {
    fn drop(&mut self) {
        self.private_key_b64.zeroize();
    }
}

/// Generate a fresh keypair: 32 random bytes clamped per Curve25519,
/// public key derived via scalar base multiplication. `x25519-dalek`'s
/// `StaticSecret::random_from_rng` already applies the clamp
/// (`&= 0xf8` on byte 0, `&= 0x7f` then `|= 0x40` on byte 31).
pub fn generate_keypair() -> Keypair {
    let mut rng = rand::rngs::OsRng;
    let mut seed = [0u8; 32];
    rng.fill_bytes(&mut seed);
    let secret = StaticSecret::from(seed);
    let public = PublicKey::from(&secret);

    Keypair {
        private_key_b64: base64::engine::general_purpose::STANDARD.encode(secret.to_bytes()),
        public_key_b64: base64::engine::general_purpose::STANDARD.encode(public.to_bytes()),
    }
}

/// Derive the public key for a base64-encoded private key (used when
/// re-deriving from a persisted, decrypted private key).
pub fn public_key_for(private_key_b64: &str) -> anyhow::Result<String> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(private_key_b64)?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("private key must be 32 bytes"))?;
    let secret = StaticSecret::from(arr);
    let public = PublicKey::from(&secret);
    Ok(base64::engine::general_purpose::STANDARD.encode(public.to_bytes()))
}
