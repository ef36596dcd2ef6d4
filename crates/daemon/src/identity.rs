use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use log::info;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_IDENTITY_DIR: &str = ".meshd";
const PRIVATE_KEY_FILE: &str = "private.key";

/// WireGuard keypair of this node.
pub struct Identity {
    private_key: [u8; 32],
    public_key: [u8; 32],
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn generate() -> Result<Self> {
        let mut private_key = [0u8; 32];
        OsRng.fill_bytes(&mut private_key);
        // X25519 clamping, as `wg genkey` does
        private_key[0] &= 248;
        private_key[31] &= 127;
        private_key[31] |= 64;
        Self::from_private_key(private_key)
    }

    pub fn from_private_key(private_key: [u8; 32]) -> Result<Self> {
        let public_key = derive_public_key(&private_key)?;
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Parse a base64 private key as written by `wg genkey`.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .context("private key is not valid base64")?;
        let private_key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("private key must be 32 bytes, got {}", bytes.len()))?;
        Self::from_private_key(private_key)
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_IDENTITY_DIR)
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let key_path = dir.join(PRIVATE_KEY_FILE);
        let encoded = fs::read_to_string(&key_path)
            .with_context(|| format!("Failed to read private key from {:?}", key_path))?;
        let id = Self::from_base64(&encoded)
            .with_context(|| format!("Invalid private key in {:?}", key_path))?;
        info!("Loaded identity from {:?}", key_path);
        Ok(id)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).context("Failed to create identity directory")?;
        let key_path = dir.join(PRIVATE_KEY_FILE);
        fs::write(&key_path, format!("{}\n", self.private_key_base64()))
            .with_context(|| format!("Failed to write private key to {:?}", key_path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
        }

        info!("Saved identity to {:?}", key_path);
        Ok(())
    }

    /// Load the keypair under `dir`, creating one if none exists yet.
    pub fn load_or_generate(dir: Option<&Path>) -> Result<Self> {
        let dir = dir.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        if dir.join(PRIVATE_KEY_FILE).exists() {
            return Self::load(&dir);
        }
        info!("Generating new WireGuard keypair...");
        let id = Self::generate()?;
        id.save(&dir)?;
        Ok(id)
    }

    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.public_key)
    }

    pub fn private_key_base64(&self) -> String {
        STANDARD.encode(self.private_key)
    }
}

/// X25519 base point multiplication via snow's DH resolver.
fn derive_public_key(private_key: &[u8; 32]) -> Result<[u8; 32]> {
    use snow::params::DHChoice;
    use snow::resolvers::{CryptoResolver, DefaultResolver};

    let mut dh = DefaultResolver
        .resolve_dh(&DHChoice::Curve25519)
        .context("Curve25519 unavailable")?;
    dh.set(private_key);

    let mut pk = [0u8; 32];
    pk.copy_from_slice(dh.pubkey());
    Ok(pk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_keypair() {
        // RFC 7748 section 6.1, Alice
        let private = "dwdtCnMYpX08FsFyUbJmRd9ML4frwJkqsXf7pR25LCo=";
        let id = Identity::from_base64(private).unwrap();
        assert_eq!(id.public_key_base64(), "hSDwCYkwp1R0i33ctD73Wg2/Og0mOBr066SpjqqbTmo=");
        assert_eq!(id.private_key_base64(), private);
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert!(Identity::from_base64("not base64!").is_err());
        assert!(Identity::from_base64("AAAA").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("meshd-identity-{}", std::process::id()));
        let created = Identity::load_or_generate(Some(&dir)).unwrap();
        let loaded = Identity::load_or_generate(Some(&dir)).unwrap();
        assert_eq!(created.public_key_base64(), loaded.public_key_base64());
        let _ = fs::remove_dir_all(dir);
    }
}
