//! Device/user identity sent to the backend as the `user` of every turn.
//!
//! Generated once (`user_zenava_<millis>_<9 base36 chars>`) and kept in the store so that
//! the backend sees the same user across restarts.

use anyhow::Result;

use crate::store::{self, KeyValueStore, KEY_USER_ID};

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a fresh user id.
pub fn generate_user_id() -> Result<String> {
    let mut bytes = [0u8; 9];
    getrandom::getrandom(&mut bytes).map_err(|e| anyhow::anyhow!("getrandom: {}", e))?;
    let suffix: String = bytes
        .iter()
        .map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char)
        .collect();
    Ok(format!(
        "user_zenava_{}_{}",
        crate::session::now_millis(),
        suffix
    ))
}

/// Load the stored user id, or generate and persist a new one.
pub fn load_or_create_user_id(store: &dyn KeyValueStore) -> Result<String> {
    if let Some(id) = store::load::<String>(store, KEY_USER_ID) {
        let id = id.trim().to_string();
        if !id.is_empty() {
            return Ok(id);
        }
    }
    let id = generate_user_id()?;
    store::save(store, KEY_USER_ID, &id)?;
    log::info!("generated user id {}", id);
    Ok(id)
}
