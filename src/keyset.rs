// SPDX-License-Identifier: MIT
//! Issuer keys: the signer's identity and the verifier's keyset, plus
//! their on-disk forms.
//!
//! Private file: `{"kid": "...", "privkey_b64u": "..."}` holding the raw
//! 64-byte Ed25519 keypair (private + public halves). Public file:
//! `{"keys": {"<kid>": "<pubkey_b64u>"}}`. Both are written atomically —
//! temp file in the target directory, fsync, rename — with 0600 / 0644
//! modes on POSIX.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};

use crate::b64;

#[derive(Serialize, Deserialize)]
struct PrivateKeyFile {
    kid: String,
    privkey_b64u: String,
}

#[derive(Serialize, Deserialize, Default)]
struct PublicKeysFile {
    keys: BTreeMap<String, String>,
}

/// The signer's half: one kid and its Ed25519 keypair.
pub struct SigningIdentity {
    pub kid: String,
    key: SigningKey,
}

impl SigningIdentity {
    pub fn generate(kid: impl Into<String>) -> Self {
        Self {
            kid: kid.into(),
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Wrap an existing key under a kid (tests, fixed seeds, imports).
    pub fn from_parts(kid: impl Into<String>, key: SigningKey) -> Self {
        Self {
            kid: kid.into(),
            key,
        }
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.key
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read private key file {}", path.display()))?;
        let file: PrivateKeyFile =
            serde_json::from_str(&raw).context("private key file is not valid JSON")?;
        let keypair = b64::decode(&file.privkey_b64u)
            .map_err(|e| anyhow::anyhow!("privkey_b64u is not base64url: {e}"))?;
        let keypair: [u8; 64] = keypair
            .try_into()
            .map_err(|_| anyhow::anyhow!("privkey_b64u must decode to 64 bytes"))?;
        let key = SigningKey::from_keypair_bytes(&keypair)
            .context("privkey_b64u is not a valid Ed25519 keypair")?;
        Ok(Self { kid: file.kid, key })
    }

    /// Write the private key file (mode 0600 on POSIX).
    pub fn save(&self, path: &Path, pretty: bool) -> Result<()> {
        let file = PrivateKeyFile {
            kid: self.kid.clone(),
            privkey_b64u: b64::encode(self.key.to_keypair_bytes()),
        };
        let json = if pretty {
            serde_json::to_vec_pretty(&file)?
        } else {
            serde_json::to_vec(&file)?
        };
        atomic_write(path, &json, 0o600)
    }
}

/// The verifier's half: `kid → Ed25519 public key`.
#[derive(Default, Clone)]
pub struct IssuerKeyset {
    keys: BTreeMap<String, VerifyingKey>,
}

impl IssuerKeyset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kid: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(kid.into(), key);
    }

    pub fn get(&self, kid: &str) -> Option<&VerifyingKey> {
        self.keys.get(kid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read issuer keys file {}", path.display()))?;
        let file: PublicKeysFile =
            serde_json::from_str(&raw).context("issuer keys file is not valid JSON")?;
        let mut keys = BTreeMap::new();
        for (kid, pub_b64u) in file.keys {
            let raw = b64::decode(&pub_b64u)
                .map_err(|e| anyhow::anyhow!("pubkey for kid {kid:?} is not base64url: {e}"))?;
            let raw: [u8; 32] = raw
                .try_into()
                .map_err(|_| anyhow::anyhow!("pubkey for kid {kid:?} must be 32 bytes"))?;
            let key = VerifyingKey::from_bytes(&raw)
                .with_context(|| format!("pubkey for kid {kid:?} is not a valid Ed25519 point"))?;
            keys.insert(kid, key);
        }
        Ok(Self { keys })
    }

    /// Write the public keys file (mode 0644 on POSIX).
    pub fn save(&self, path: &Path, pretty: bool) -> Result<()> {
        let file = PublicKeysFile {
            keys: self
                .keys
                .iter()
                .map(|(kid, key)| (kid.clone(), b64::encode(key.to_bytes())))
                .collect(),
        };
        let json = if pretty {
            serde_json::to_vec_pretty(&file)?
        } else {
            serde_json::to_vec(&file)?
        };
        atomic_write(path, &json, 0o644)
    }
}

/// Temp-file-plus-rename write in the destination's directory. The rename
/// replaces any existing file; where the platform refuses that, the
/// destination is removed first and the rename retried. Mode bits are
/// enforced after the rename, best-effort.
fn atomic_write(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let dir = match path.parent() {
        // A bare file name has an empty parent; treat it as the cwd.
        Some(d) if !d.as_os_str().is_empty() => d,
        Some(_) => Path::new("."),
        None => bail!("destination {} has no parent directory", path.display()),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("cannot create directory {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("cannot create temp file in {}", dir.display()))?;
    tmp.write_all(contents).context("temp file write failed")?;
    tmp.as_file().sync_all().context("temp file fsync failed")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))
            .context("temp file chmod failed")?;
    }

    match tmp.persist(path) {
        Ok(_) => {}
        Err(persist_err) => {
            // Rename over an existing file can fail on some platforms.
            let _ = std::fs::remove_file(path);
            persist_err
                .file
                .persist(path)
                .with_context(|| format!("cannot rename temp file to {}", path.display()))?;
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("issuer_private.json");
        let identity = SigningIdentity::generate("kid_1");
        identity.save(&path, false).unwrap();

        let loaded = SigningIdentity::load(&path).unwrap();
        assert_eq!(loaded.kid, "kid_1");
        assert_eq!(
            loaded.verifying_key().to_bytes(),
            identity.verifying_key().to_bytes()
        );
    }

    #[test]
    fn public_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("issuer_keys.json");
        let a = SigningIdentity::generate("kid_a");
        let b = SigningIdentity::generate("kid_b");
        let mut keyset = IssuerKeyset::new();
        keyset.insert(a.kid.clone(), a.verifying_key());
        keyset.insert(b.kid.clone(), b.verifying_key());
        keyset.save(&path, true).unwrap();

        let loaded = IssuerKeyset::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded.get("kid_a").unwrap().to_bytes(),
            a.verifying_key().to_bytes()
        );
    }

    #[cfg(unix)]
    #[test]
    fn file_modes_are_enforced() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let private = dir.path().join("private.json");
        let public = dir.path().join("keys.json");
        let identity = SigningIdentity::generate("kid_1");
        identity.save(&private, false).unwrap();
        let mut keyset = IssuerKeyset::new();
        keyset.insert("kid_1", identity.verifying_key());
        keyset.save(&public, false).unwrap();

        let pmode = std::fs::metadata(&private).unwrap().permissions().mode() & 0o777;
        let kmode = std::fs::metadata(&public).unwrap().permissions().mode() & 0o777;
        assert_eq!(pmode, 0o600);
        assert_eq!(kmode, 0o644);
    }

    #[test]
    fn atomic_write_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(&path, b"old contents").unwrap();
        let mut keyset = IssuerKeyset::new();
        keyset.insert("kid_1", SigningIdentity::generate("kid_1").verifying_key());
        keyset.save(&path, false).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("kid_1"));
    }

    #[test]
    fn corrupt_private_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private.json");
        std::fs::write(&path, b"{\"kid\":\"k\",\"privkey_b64u\":\"AAAA\"}").unwrap();
        assert!(SigningIdentity::load(&path).is_err());
    }
}
