//! OpenSSH public key helpers: parsing `authorized_keys` style lines,
//! exact matching and fingerprints for logging.

use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine as _;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use tracing::warn;

/// Parse a single `authorized_keys` line such as
/// `ssh-ed25519 AAAAC3Nza... alice@laptop`.  Leading options are skipped.
pub fn parse_authorized_key(line: &str) -> Result<PublicKey> {
    let mut tokens = line.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        let Some(blob) = tokens.peek() else { break };
        if let Ok(key) = russh_keys::parse_public_key_base64(blob) {
            if key.name() == token {
                return Ok(key);
            }
        }
    }
    anyhow::bail!("no OpenSSH public key found in line")
}

/// Parse every key in an `authorized_keys` document, skipping blank lines,
/// comments and lines that do not hold a key.
pub fn parse_authorized_keys(text: &str) -> Vec<PublicKey> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match parse_authorized_key(line) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(error = %e, "skipping unparseable public key line");
                None
            }
        })
        .collect()
}

/// Read a single OpenSSH public key from `path`.
pub fn load_public_key(path: &Path) -> Result<PublicKey> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read public key file: {}", path.display()))?;
    parse_authorized_keys(&text)
        .into_iter()
        .next()
        .with_context(|| format!("no public key in {}", path.display()))
}

/// Exact match on algorithm and key material.
pub fn same_key(a: &PublicKey, b: &PublicKey) -> bool {
    a.name() == b.name() && a.public_key_base64() == b.public_key_base64()
}

/// SHA-256 fingerprint in `ssh-keygen -l` format (`SHA256:...`).
pub fn fingerprint(key: &PublicKey) -> String {
    let blob = base64::engine::general_purpose::STANDARD
        .decode(key.public_key_base64().as_bytes())
        .unwrap_or_default();
    let hash = Sha256::digest(&blob);
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash)
    )
}
