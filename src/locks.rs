// =============================================================================
// AI single-flight lock -- at most one explanation per symbol, fleet-wide
// =============================================================================
//
// Acquire is an atomic "set if absent" with a millisecond TTL so a crashed
// holder can never starve the fleet. Release is a compare-and-delete keyed on
// the holder's token: releasing a lock we no longer own is a silent no-op.
// =============================================================================

use anyhow::Result;
use uuid::Uuid;

use crate::store::{ai_lock_key, KeyedStore};

/// Lock lifetime (60 seconds).
pub const AI_LOCK_TTL_MS: u64 = 60_000;

/// Try to acquire the AI generation lock for `symbol`.
///
/// Returns a unique token on success (needed for release), or `None` when
/// the lock is already held elsewhere.
pub async fn acquire_ai_lock(store: &dyn KeyedStore, symbol: &str) -> Result<Option<String>> {
    let token = Uuid::new_v4().simple().to_string();
    let acquired = store
        .set_nx_px(&ai_lock_key(symbol), &token, AI_LOCK_TTL_MS)
        .await?;
    Ok(acquired.then_some(token))
}

/// Release the lock only if we still own it.
pub async fn release_ai_lock(store: &dyn KeyedStore, symbol: &str, token: &str) -> Result<()> {
    store
        .compare_and_delete(&ai_lock_key(symbol), token)
        .await?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
