//! Lot activation sweep: keeps listing state in line with inventory after
//! every order-list change.

use std::sync::Arc;
use std::time::Duration;

use funpay_client::error::ClientError;
use funpay_client::types::LotShortcut;
use tracing::{error, info, warn};

use crate::control_plane::NotificationKind;
use crate::cortex::Cortex;
use crate::inventory;

const SAVE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LotTask {
    Restore,
    Deactivate,
}

/// Saving an activated lot whose built-in stock is empty bounces with a
/// field error on `secrets`; clearing the auto-delivery checkbox resolves
/// it, applied at most once per save.
async fn save_lot_with_secrets_workaround(
    cortex: &Arc<Cortex>,
    lot_id: i64,
    active: bool,
) -> Result<(), ClientError> {
    let mut fields = cortex.account().get_lot_fields(lot_id).await?;
    fields.set_active(active);
    match cortex.account().save_lot(&fields).await {
        Ok(()) => Ok(()),
        Err(ClientError::LotSaving { errors }) if errors.contains_key("secrets") => {
            warn!(lot_id, "empty-secrets conflict, disabling built-in delivery and retrying");
            fields.set_auto_delivery(false);
            cortex.account().save_lot(&fields).await
        }
        Err(e) => Err(e),
    }
}

/// One lot state change, up to three attempts with growing backoff.
async fn update_lot_state(cortex: &Arc<Cortex>, lot: &LotShortcut, task: LotTask) -> bool {
    let description = lot.description.clone().unwrap_or_default();
    for attempt in 1..=SAVE_ATTEMPTS {
        match save_lot_with_secrets_workaround(cortex, lot.id, task == LotTask::Restore).await {
            Ok(()) => {
                match task {
                    LotTask::Restore => info!(lot = %description, "lot restored"),
                    LotTask::Deactivate => info!(lot = %description, "lot deactivated"),
                }
                return true;
            }
            Err(ClientError::RequestFailed { status: 404, .. }) => {
                error!(lot = %description, "lot no longer exists upstream, giving up");
                return false;
            }
            Err(e) => {
                error!(
                    lot = %description,
                    attempt,
                    error = %e,
                    "lot state change failed"
                );
                tokio::time::sleep(Duration::from_secs(3 * attempt as u64)).await;
            }
        }
    }
    error!(lot = %description, "lot state change failed: attempts exhausted");
    false
}

/// The sweep. Runs only once per runner tag and only after the tagged
/// background profile refresh has landed, so decisions are made against
/// the post-order state of the listings.
pub async fn update_lots_states(cortex: &Arc<Cortex>, tag: &str) {
    let auto_restore = cortex.autorestore_enabled();
    let auto_disable = cortex.autodisable_enabled();
    if !auto_restore && !auto_disable {
        return;
    }
    if cortex.curr_profile_tag().as_deref() != Some(tag) {
        return;
    }
    if !cortex.claim_state_change(tag) {
        return;
    }
    let Some(current) = cortex.curr_profile() else {
        return;
    };
    let Some(known) = cortex.profile() else {
        return;
    };

    let active_ids = current.lot_ids();
    let mut restored = Vec::new();
    let mut deactivated = Vec::new();

    for lot in known.common_lots() {
        let Some(description) = lot.description.clone() else {
            continue;
        };
        let rule = cortex
            .auto_delivery
            .read()
            .find_containing(&description)
            .map(|(_, rule)| rule.clone());

        let stock = |rule: &bot_config::DeliveryRule| match &rule.products_file_name {
            Some(file) => inventory::count(&cortex.paths.product_file(file)),
            // No inventory file: stock is never the reason to deactivate.
            None => 1,
        };

        let task = if !active_ids.contains(&lot.id) {
            match &rule {
                None => auto_restore.then_some(LotTask::Restore),
                Some(rule) if auto_restore && !rule.disable_auto_restore => {
                    if !auto_disable || stock(rule) > 0 {
                        Some(LotTask::Restore)
                    } else {
                        None
                    }
                }
                Some(_) => None,
            }
        } else {
            match &rule {
                Some(rule)
                    if auto_disable && !rule.disable_auto_disable && stock(rule) == 0 =>
                {
                    Some(LotTask::Deactivate)
                }
                _ => None,
            }
        };

        if let Some(task) = task {
            if update_lot_state(cortex, lot, task).await {
                match task {
                    LotTask::Restore => restored.push(description),
                    LotTask::Deactivate => deactivated.push(description),
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    if !deactivated.is_empty() {
        cortex.bridge.notify(
            NotificationKind::LotDeactivate,
            format!("Deactivated lots:\n{}", deactivated.join("\n")),
        );
    }
    if !restored.is_empty() {
        cortex.bridge.notify(
            NotificationKind::LotActivate,
            format!("Restored lots:\n{}", restored.join("\n")),
        );
    }
}
