//! Per-account device identity minting.
//!
//! Each account presents a stable `quotaUser`/`deviceId` pair to the
//! upstream API so its traffic reads as one consistent device rather than
//! a pool of interchangeable callers. The pair is minted once (on first
//! use) and kept for the account's lifetime; [`regenerate`] produces a
//! fresh one when an account keeps failing for capacity-looking reasons,
//! on the theory that the old identity is now associated with exhausted
//! capacity upstream.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::account::Fingerprint;

/// Mint a fingerprint for `account_index`. Deterministic in the `device_id`
/// derivation's namespacing but randomized in its entropy source, so
/// repeated calls for the same index still produce distinct identities —
/// determinism here only means "stable once stored on the account", not
/// "reproducible from the index alone".
pub fn mint(account_index: usize) -> Fingerprint {
    generate(account_index)
}

/// Produce a new fingerprint to replace an existing one, e.g. after
/// repeated capacity-looking failures on the current identity.
pub fn regenerate(account_index: usize) -> Fingerprint {
    generate(account_index)
}

fn generate(account_index: usize) -> Fingerprint {
    let mut entropy = [0u8; 32];
    rand::rng().fill_bytes(&mut entropy);

    let device_id = URL_SAFE_NO_PAD.encode(entropy);

    let mut hasher = Sha256::new();
    hasher.update(account_index.to_le_bytes());
    hasher.update(entropy);
    let digest = hasher.finalize();
    // A short stable tag, not a secret — just needs to be unlikely to
    // collide between accounts so upstream logs stay attributable.
    let quota_user = URL_SAFE_NO_PAD.encode(&digest[..12]);

    Fingerprint {
        quota_user,
        device_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_produces_url_safe_identifiers() {
        let fp = mint(0);
        assert!(
            fp.device_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        assert!(
            fp.quota_user
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn successive_mints_do_not_collide() {
        let a = mint(0);
        let b = mint(0);
        assert_ne!(a.device_id, b.device_id);
        assert_ne!(a.quota_user, b.quota_user);
    }

    #[test]
    fn regenerate_produces_a_different_identity() {
        let original = mint(3);
        let regenerated = regenerate(3);
        assert_ne!(original.device_id, regenerated.device_id);
    }
}
