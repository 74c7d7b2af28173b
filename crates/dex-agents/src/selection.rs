//! Deterministic agent selection.
//!
//! Both trade parties must pick the same mediator or refund agent without a
//! round trip. The pick is the SHA-256 digest of the trade id, reduced modulo
//! the number of candidates, over candidates ordered by address.

use dex_core::{sha256_digest, CanonicalBytes, TradeId};

/// Seed derived from the trade id.
pub fn selection_seed(trade_id: &TradeId) -> u64 {
    match CanonicalBytes::new(trade_id) {
        Ok(canonical) => sha256_digest(&canonical).leading_u64(),
        Err(e) => {
            tracing::warn!(trade_id = %trade_id, error = %e, "falling back to raw uuid seed");
            trade_id.as_uuid().as_u64_pair().0
        }
    }
}

/// Pick one candidate. `candidates` must already be in canonical order.
pub fn pick<'a, T>(candidates: &'a [T], trade_id: &TradeId) -> Option<&'a T> {
    if candidates.is_empty() {
        return None;
    }
    let len = u64::try_from(candidates.len()).unwrap_or(u64::MAX);
    let index = usize::try_from(selection_seed(trade_id) % len).unwrap_or(0);
    candidates.get(index)
}
