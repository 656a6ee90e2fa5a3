//! Raise scheduler: walks profile categories in order and re-raises their
//! common-type lots, honouring upstream cooldowns.

use std::sync::Arc;
use std::time::Duration;

use funpay_client::error::ClientError;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::control_plane::NotificationKind;
use crate::cortex::{Cortex, DegradedReason};

/// Re-raise delay after a successful raise.
const RAISE_PERIOD: i64 = 7200;
/// Fallback cooldown when the upstream refusal carries no parsable delay.
const DEFAULT_WAIT: i64 = 60;
const IDLE_POLL: Duration = Duration::from_secs(10);

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// One pass over all categories. Returns the unix time of the next useful
/// wakeup, or `None` when the loop should stop (degraded).
async fn raise_round(cortex: &Arc<Cortex>) -> Option<i64> {
    let Some(profile) = cortex.profile() else {
        return Some(now() + 300);
    };
    if profile.is_empty() {
        debug!("no lots in profile, nothing to raise");
        return Some(now() + 300);
    }

    let mut next_call = i64::MAX;
    for category in profile.categories() {
        let current = now();
        if let Some(at) = cortex.raise_times.lock().get(&category.id).copied() {
            if at > current {
                next_call = next_call.min(at);
                continue;
            }
        }

        let subcategories = profile.common_subcategories_with_lots(category.id);
        if subcategories.is_empty() {
            // Nothing raisable here; without a long cooldown this category
            // would spin the loop every pass.
            let at = current + RAISE_PERIOD;
            cortex.raise_times.lock().insert(category.id, at);
            next_call = next_call.min(at);
            continue;
        }

        let pacing = rand::thread_rng().gen_range(0.5..1.5);
        tokio::time::sleep(Duration::from_secs_f64(pacing)).await;

        match cortex
            .account()
            .raise_lots(category.id, &subcategories)
            .await
        {
            Ok(()) => {
                let current = now();
                let previous = cortex.raised_times.lock().insert(category.id, current);
                let at = current + RAISE_PERIOD;
                cortex.raise_times.lock().insert(category.id, at);
                next_call = next_call.min(at);
                info!(category = %category.name, "lots raised");
                let since = previous
                    .map(|p| format!(" Previous raise {}s ago.", current - p))
                    .unwrap_or_default();
                cortex.bridge.notify(
                    NotificationKind::Raise,
                    format!("Raised all lots of category {}.{since}", category.name),
                );
            }
            Err(ClientError::Raise {
                wait_time,
                error_message,
            }) => {
                let wait = wait_time.map(|w| w as i64).unwrap_or(DEFAULT_WAIT);
                warn!(
                    category = %category.name,
                    wait,
                    "raise refused: {error_message}"
                );
                let at = now() + wait;
                cortex.raise_times.lock().insert(category.id, at);
                next_call = next_call.min(at);
            }
            Err(ClientError::Unauthorized) => {
                warn!(category = %category.name, "session token rejected during raise");
                cortex.enter_degraded(
                    DegradedReason::Credentials,
                    "The marketplace rejected the session token while raising lots. \
                     A new token is required.",
                );
                return None;
            }
            Err(e @ ClientError::Network(_)) => {
                error!(error = %e, "network error in the raise loop");
                return Some(now() + 60);
            }
            Err(e) => {
                error!(category = %category.name, error = %e, "unexpected raise failure");
                let pause = rand::thread_rng().gen_range(30.0..60.0);
                tokio::time::sleep(Duration::from_secs_f64(pause)).await;
                next_call = next_call.min(now() + 1);
            }
        }
    }

    Some(if next_call == i64::MAX {
        now() + 300
    } else {
        next_call
    })
}

/// The scheduler task; runs while the generation token holds.
pub async fn raise_loop(cortex: Arc<Cortex>, my_generation: u64) {
    info!("raise loop started");
    loop {
        if cortex.state.generation() != my_generation {
            info!("raise loop generation changed, stopping");
            return;
        }
        if !cortex.state.is_healthy() {
            tokio::time::sleep(IDLE_POLL).await;
            continue;
        }
        if !cortex.autoraise_enabled() {
            tokio::time::sleep(IDLE_POLL).await;
            continue;
        }

        let Some(next_call) = raise_round(&cortex).await else {
            return;
        };
        let delay = next_call - now();
        if delay <= 0 {
            let pause = rand::thread_rng().gen_range(1.0..3.0);
            tokio::time::sleep(Duration::from_secs_f64(pause)).await;
            continue;
        }
        debug!(seconds = delay, "next raise attempt");
        // Sleep in short slices so generation changes are noticed promptly.
        let mut remaining = delay;
        while remaining > 0 && cortex.state.generation() == my_generation {
            let slice = remaining.min(10);
            tokio::time::sleep(Duration::from_secs(slice as u64)).await;
            remaining -= slice;
        }
    }
}
