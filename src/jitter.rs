//! TTL jitter
//!
//! Entries written at the same instant would otherwise expire together and
//! be recomputed together. Each write perturbs its TTL by a uniform factor in
//! `[1 - pct, 1 + pct]`.

use std::time::Duration;

use rand::Rng;

/// Smallest TTL ever handed to the backing store
const MIN_TTL: Duration = Duration::from_millis(1);

/// Largest TTL ever handed to the backing store, about ten years
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Jittered TTL using the thread-local generator
pub fn jittered_ttl(base: Duration, jitter_pct: f64) -> Duration {
    jittered_ttl_with(&mut rand::thread_rng(), base, jitter_pct)
}

/// Jittered TTL drawn from `rng`, kept within `[MIN_TTL, MAX_TTL]`
pub fn jittered_ttl_with<R: Rng + ?Sized>(rng: &mut R, base: Duration, jitter_pct: f64) -> Duration {
    let base = base.clamp(MIN_TTL, MAX_TTL);
    if !(jitter_pct > 0.0) {
        return base;
    }
    let pct = jitter_pct.min(1.0);
    let factor = 1.0 + rng.gen_range(-pct..=pct);
    Duration::try_from_secs_f64(base.as_secs_f64() * factor)
        .unwrap_or(MAX_TTL)
        .clamp(MIN_TTL, MAX_TTL)
}
