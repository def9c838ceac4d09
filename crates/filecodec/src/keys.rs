use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const ENCRYPTION_LABEL: &[u8] = b"block-encryption";
const AUTHENTICATION_LABEL: &[u8] = b"object-authentication";

/// Keys derived from an account's secret, one per concern.
///
/// Domain-separated HMAC-SHA256 derivation, so the encryption and
/// authentication keys never coincide even for a weak secret.
#[derive(Clone)]
pub struct AccountKeys {
    encryption: [u8; 16],
    authentication: [u8; 32],
}

impl AccountKeys {
    /// Derives the key set from the account secret.
    #[must_use]
    pub fn derive(secret: &[u8]) -> Self {
        let mut encryption = [0u8; 16];
        encryption.copy_from_slice(&derive_one(secret, ENCRYPTION_LABEL)[..16]);
        Self {
            encryption,
            authentication: derive_one(secret, AUTHENTICATION_LABEL),
        }
    }

    /// AES-128 key for block data.
    #[must_use]
    pub(crate) fn encryption(&self) -> &[u8; 16] {
        &self.encryption
    }

    /// HMAC key for object authentication.
    #[must_use]
    pub(crate) fn authentication(&self) -> &[u8; 32] {
        &self.authentication
    }
}

impl std::fmt::Debug for AccountKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.write_str("AccountKeys(..)")
    }
}

fn derive_one(secret: &[u8], label: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(label);
    mac.finalize().into_bytes().into()
}
