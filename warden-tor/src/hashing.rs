//! Control secret hashing for `HashedControlPassword`
//!
//! The daemon's own `--hash-password` is preferred. When the binary is
//! unavailable or its output does not verify, the same iterated and salted
//! S2K (RFC 2440, SHA-1, 8-byte salt, 65536 bytes hashed) is computed here.
//! There is no embedded default: an unusable secret is a configuration error.

use std::path::Path;
use std::time::Duration;

use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::process::Command;
use tracing::{debug, warn};

use warden_core::{Result, WardenError};

/// Encoded iteration count, Tor's fixed choice (65536 bytes)
const S2K_SPECIFIER: u8 = 0x60;
const SALT_LEN: usize = 8;
const DIGEST_LEN: usize = 20;

/// Hash a control secret, preferring the daemon binary
pub async fn hash_control_secret(
    secret: &str,
    tor_binary: Option<&Path>,
    timeout: Duration,
) -> Result<String> {
    if secret.trim().is_empty() {
        return Err(WardenError::Configuration(
            "control secret is empty; refusing to configure an unauthenticated control port"
                .into(),
        ));
    }

    if let Some(binary) = tor_binary {
        match hash_with_daemon(binary, secret, timeout).await {
            Some(hashed) if verify_hashed_secret(secret, &hashed) => {
                debug!("Control secret hashed by {}", binary.display());
                return Ok(hashed);
            },
            Some(_) => warn!("Daemon produced a hash that does not verify; hashing locally"),
            None => debug!("Daemon hashing unavailable; hashing locally"),
        }
    }

    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    Ok(s2k_hash(secret.as_bytes(), salt))
}

async fn hash_with_daemon(binary: &Path, secret: &str, timeout: Duration) -> Option<String> {
    let run = Command::new(binary)
        .args(["--hash-password", secret, "--quiet"])
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, run).await {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(Ok(output)) => {
            debug!("{} --hash-password exited with {}", binary.display(), output.status);
            return None;
        },
        Ok(Err(e)) => {
            debug!("Could not run {}: {}", binary.display(), e);
            return None;
        },
        Err(_) => {
            warn!("{} --hash-password timed out", binary.display());
            return None;
        },
    };

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with("16:"))
        .map(str::to_string)
}

/// `16:` + hex(salt || specifier || SHA-1 over repeated salt||secret)
pub fn s2k_hash(secret: &[u8], salt: [u8; SALT_LEN]) -> String {
    let digest = s2k_digest(secret, &salt, S2K_SPECIFIER);

    let mut encoded = Vec::with_capacity(SALT_LEN + 1 + DIGEST_LEN);
    encoded.extend_from_slice(&salt);
    encoded.push(S2K_SPECIFIER);
    encoded.extend_from_slice(&digest);
    format!("16:{}", hex::encode_upper(encoded))
}

/// Check a `16:` hash against a plaintext secret
pub fn verify_hashed_secret(secret: &str, hashed: &str) -> bool {
    let Some(decoded) = hashed.strip_prefix("16:").and_then(|h| hex::decode(h).ok()) else {
        return false;
    };
    if decoded.len() != SALT_LEN + 1 + DIGEST_LEN {
        return false;
    }

    let (salt, rest) = decoded.split_at(SALT_LEN);
    let specifier = rest[0];
    s2k_digest(secret.as_bytes(), salt, specifier)[..] == rest[1..]
}

fn s2k_digest(secret: &[u8], salt: &[u8], specifier: u8) -> [u8; DIGEST_LEN] {
    let mut count = (16usize + (specifier & 15) as usize) << ((specifier >> 4) + 6);

    let mut input = Vec::with_capacity(salt.len() + secret.len());
    input.extend_from_slice(salt);
    input.extend_from_slice(secret);

    let mut hasher = Sha1::new();
    while count > 0 {
        let take = count.min(input.len());
        hasher.update(&input[..take]);
        count -= take;
    }
    hasher.finalize().into()
}
