//! SSH key handling shared by the proxy and the daemon.
//!
//! This module handles:
//! - Computing key fingerprints in the `ssh-keygen -l` format
//! - Parsing OpenSSH public key lines
//! - Decoding private keys from configuration or placement records

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use russh::keys::{PrivateKey, PublicKey};
use sha2::{Digest, Sha256};

/// Parse an SSH public key string into (type, base64_data).
///
/// Handles formats like:
/// - "ssh-ed25519 AAAA... comment"
/// - "ssh-rsa AAAA... comment"
pub fn parse_ssh_key(key: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = key.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(anyhow!("Invalid SSH key format: too few parts"));
    }

    let key_type = parts[0].to_string();
    let key_data = parts[1].to_string();

    base64::engine::general_purpose::STANDARD
        .decode(&key_data)
        .with_context(|| "Invalid base64 in SSH key")?;

    Ok((key_type, key_data))
}

/// Parse an OpenSSH public key line into a key the SSH engine understands.
pub fn parse_public_key(line: &str) -> Result<PublicKey> {
    let (key_type, key_data) = parse_ssh_key(line)?;
    let key = russh::keys::parse_public_key_base64(&key_data)
        .with_context(|| format!("Failed to decode {} public key", key_type))?;
    Ok(key)
}

/// Compute fingerprint from raw key bytes (wire format).
/// SSH fingerprint = SHA256(raw_key_bytes_in_wire_format)
pub fn fingerprint_from_bytes(key_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_bytes);
    let hash = hasher.finalize();

    let b64 = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{}", b64)
}

/// Compute the fingerprint of a public key, e.g. `SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU`.
pub fn fingerprint(key: &PublicKey) -> String {
    use russh::keys::PublicKeyBase64;
    fingerprint_from_bytes(&key.public_key_bytes())
}

/// Whether `key` matches an expected fingerprint string.
pub fn fingerprint_matches(key: &PublicKey, expected: &str) -> bool {
    fingerprint(key) == expected.trim()
}

/// Decode a private key given as OpenSSH or PEM text.
pub fn decode_private_key(text: &str) -> Result<PrivateKey> {
    russh::keys::decode_secret_key(text.trim(), None).context("Failed to decode private key")
}

/// Load a host key from inline text or from a file, whichever is configured.
///
/// Inline text wins when both are present. Returns `None` when neither is set.
pub fn load_host_key(inline: Option<&str>, path: Option<&Path>) -> Result<Option<PrivateKey>> {
    if let Some(text) = inline.filter(|t| !t.trim().is_empty()) {
        return decode_private_key(text).map(Some);
    }

    match path {
        Some(path) => {
            let key = russh::keys::load_secret_key(path, None)
                .with_context(|| format!("Failed to load host key from {}", path.display()))?;
            Ok(Some(key))
        }
        None => Ok(None),
    }
}

/// Generate a fresh Ed25519 key. Used for daemon host keys that are not configured.
pub fn generate_ed25519() -> Result<PrivateKey> {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::Algorithm;

    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).context("Failed to generate Ed25519 key")
}

/// Encode a private key in OpenSSH format.
pub fn encode_private_key(key: &PrivateKey) -> Result<String> {
    use russh::keys::ssh_key::LineEnding;

    let encoded = key
        .to_openssh(LineEnding::LF)
        .context("Failed to encode private key")?;
    Ok(encoded.as_str().to_owned())
}

/// Render the public half of a key as an OpenSSH line ("ssh-ed25519 AAAA...").
pub fn public_key_line(key: &PrivateKey) -> Result<String> {
    key.public_key()
        .to_openssh()
        .context("Failed to encode public key")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ssh_key() {
        let key = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl test@example.com";
        let (key_type, _key_data) = parse_ssh_key(key).unwrap();
        assert_eq!(key_type, "ssh-ed25519");

        assert!(parse_ssh_key("ssh-ed25519").is_err());
        assert!(parse_ssh_key("ssh-ed25519 !!!notbase64").is_err());
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint_from_bytes(b"");
        // SHA256 of the empty string, unpadded base64.
        assert_eq!(fp, "SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU");
    }

    #[test]
    fn test_generated_key_round_trips_through_text() {
        let key = generate_ed25519().unwrap();
        let text = encode_private_key(&key).unwrap();
        let decoded = decode_private_key(&text).unwrap();

        let expected = fingerprint(key.public_key());
        assert_eq!(fingerprint(decoded.public_key()), expected);
        assert!(fingerprint_matches(decoded.public_key(), &format!("  {}\n", expected)));
    }

    #[test]
    fn test_public_key_line_parses_back() {
        let key = generate_ed25519().unwrap();
        let line = public_key_line(&key).unwrap();
        let parsed = parse_public_key(&line).unwrap();
        assert_eq!(fingerprint(&parsed), fingerprint(key.public_key()));
    }

    #[test]
    fn test_load_host_key_prefers_inline() {
        let key = generate_ed25519().unwrap();
        let text = encode_private_key(&key).unwrap();
        let missing = Path::new("/nonexistent/host_key");

        let loaded = load_host_key(Some(&text), Some(missing)).unwrap().unwrap();
        assert_eq!(fingerprint(loaded.public_key()), fingerprint(key.public_key()));

        assert!(load_host_key(None, None).unwrap().is_none());
        assert!(load_host_key(Some("  "), Some(missing)).is_err());
        assert!(decode_private_key("host-key").is_err());
    }
}
