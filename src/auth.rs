//! Authentication and Authorization
//!
//! - Base58 wallet address validation
//! - Social handle normalization
//! - Website visit receipts (hex SHA-256 over a server secret)
//! - Admin token check
//! - Payout idempotency references

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::types::ActionId;

/// Length in bytes of a decoded wallet public key
const WALLET_KEY_LEN: usize = 32;

/// Check if a string is a valid base58-encoded 32-byte wallet address
pub fn is_valid_wallet_address(wallet: &str) -> bool {
    if wallet.len() < 32 || wallet.len() > 44 {
        return false;
    }
    match bs58::decode(wallet).into_vec() {
        Ok(bytes) => bytes.len() == WALLET_KEY_LEN,
        Err(e) => {
            debug!("Failed to decode wallet address: {}", e);
            false
        }
    }
}

/// Longest handle accepted for a linked social account
const MAX_HANDLE_LEN: usize = 32;

/// Normalize a social handle: trim, drop a leading `@`, and accept only
/// ASCII letters, digits and `_`. `None` when nothing valid remains.
pub fn normalize_social_handle(raw: &str) -> Option<String> {
    let handle = raw.trim();
    let handle = handle.strip_prefix('@').unwrap_or(handle);
    let valid = !handle.is_empty()
        && handle.len() <= MAX_HANDLE_LEN
        && handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then(|| handle.to_string())
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Receipt issued to a wallet after it visited an action's website
pub fn visit_receipt(secret: &str, action_id: ActionId, wallet: &str) -> String {
    sha256_hex(&format!("{}:{}:{}", secret, action_id, wallet))
}

/// Verify a visit receipt submitted as proof
pub fn verify_visit_receipt(secret: &str, action_id: ActionId, wallet: &str, receipt: &str) -> bool {
    let expected = visit_receipt(secret, action_id, wallet);
    constant_time_eq(expected.as_bytes(), receipt.trim().to_lowercase().as_bytes())
}

/// Admin endpoints are disabled when no token is configured
pub fn is_admin(expected: Option<&str>, provided: Option<&str>) -> bool {
    match (expected, provided) {
        (Some(expected), Some(provided)) => {
            constant_time_eq(expected.as_bytes(), provided.as_bytes())
        }
        _ => false,
    }
}

/// Stable reference attached to a transfer so it can be looked up after
/// an ambiguous failure. `key` is the execution id or a prize winner key.
pub fn payout_reference(key: &str) -> String {
    sha256_hex(key)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
