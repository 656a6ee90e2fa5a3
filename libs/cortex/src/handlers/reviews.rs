//! Review processor: auto-replies to buyer feedback, with retry and a
//! structured operator report on exhaustion.

use std::sync::Arc;
use std::time::Duration;

use funpay_client::patterns;
use funpay_client::types::{ChatShortcut, Message, MessageType};
use tracing::{error, info, warn};

use crate::control_plane::NotificationKind;
use crate::cortex::Cortex;
use crate::expander::{self, OrderSource};

const REPLY_ATTEMPTS: u32 = 3;
const REPLY_GAP: Duration = Duration::from_secs(3);
const MAX_REPLY_CHARS: usize = 999;
const MAX_REPLY_NEWLINES: usize = 9;

/// The marketplace rejects replies over 999 characters or with more than
/// nine line breaks; overlong texts are trimmed, surplus breaks collapse
/// into spaces from the end.
fn format_review_reply(text: &str) -> String {
    let mut text: String = if text.chars().count() > MAX_REPLY_CHARS {
        let truncated: String = text.chars().take(MAX_REPLY_CHARS).collect();
        format!("{truncated}...")
    } else {
        text.to_owned()
    };
    text = text.trim().to_owned();
    while text.matches('\n').count() > MAX_REPLY_NEWLINES {
        if let Some(pos) = text.rfind('\n') {
            text.replace_range(pos..pos + 1, " ");
        }
    }
    text
}

pub fn process_review(cortex: &Arc<Cortex>, message: &Message) {
    if !matches!(
        message.kind,
        MessageType::NewFeedback | MessageType::FeedbackChanged
    ) || message.i_am_buyer
    {
        return;
    }
    let Some(text) = message.text.clone() else {
        return;
    };
    spawn_review_task(cortex, text);
}

pub fn process_review_legacy(cortex: &Arc<Cortex>, chat: &ChatShortcut) {
    let kind = patterns::classify_message(&chat.last_message_text);
    if !matches!(kind, MessageType::NewFeedback | MessageType::FeedbackChanged) {
        return;
    }
    let own = format!(" {} ", cortex.account().username());
    if chat.last_message_text.contains(&own) {
        return;
    }
    spawn_review_task(cortex, chat.last_message_text.clone());
}

fn spawn_review_task(cortex: &Arc<Cortex>, notice_text: String) {
    let cortex = Arc::clone(cortex);
    let pool = cortex.pool.clone();
    pool.spawn("review", async move {
        let Some(order_id) = patterns::find_order_id(&notice_text) else {
            warn!("feedback notice without an order id: {notice_text}");
            return;
        };
        let Some(order) = cortex.resolve_order(&order_id).await else {
            error!(order_id, "failed to resolve the reviewed order");
            return;
        };
        let Some(review) = &order.review else {
            return;
        };
        if review.stars == 0 {
            return;
        }
        info!(order_id, stars = review.stars, "new or edited review");

        let template = cortex
            .main_cfg
            .read()
            .review_reply
            .reply_for(review.stars)
            .map(str::to_owned);
        let mut sent_reply = None;
        if let Some(template) = template {
            let reply =
                format_review_reply(&expander::format_order_text(&template, &OrderSource::Full(&order)));
            for attempt in 1..=REPLY_ATTEMPTS {
                match cortex.account().send_review(&order_id, &reply).await {
                    Ok(()) => {
                        info!(order_id, "review reply posted");
                        sent_reply = Some(reply.clone());
                        break;
                    }
                    Err(e) => {
                        warn!(order_id, attempt, error = %e, "review reply failed");
                        if attempt == REPLY_ATTEMPTS {
                            error!(order_id, "review reply failed: attempts exhausted");
                            cortex.bridge.notify(
                                NotificationKind::Critical,
                                format!(
                                    "Failed to reply to the review on order {order_id} after \
                                     {REPLY_ATTEMPTS} attempts: {e}"
                                ),
                            );
                        } else {
                            tokio::time::sleep(REPLY_GAP).await;
                        }
                    }
                }
            }
        }

        let stars = "⭐".repeat(review.stars as usize);
        let mut text = format!(
            "{stars} review on order #{order_id}: {}",
            review.text.as_deref().unwrap_or("")
        );
        if let Some(reply) = sent_reply {
            text.push_str(&format!("\nReplied: {reply}"));
        }
        cortex.bridge.notify(NotificationKind::Review, text);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_reply_is_truncated() {
        let long = "x".repeat(2000);
        let formatted = format_review_reply(&long);
        assert_eq!(formatted.chars().count(), MAX_REPLY_CHARS + 3);
        assert!(formatted.ends_with("..."));
    }

    #[test]
    fn surplus_newlines_collapse_from_the_end() {
        let text = (0..15).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let formatted = format_review_reply(&text);
        assert_eq!(formatted.matches('\n').count(), MAX_REPLY_NEWLINES);
        // The earliest line breaks survive.
        assert!(formatted.starts_with("0\n1\n"));
    }

    #[test]
    fn short_reply_is_untouched() {
        assert_eq!(format_review_reply("thanks!"), "thanks!");
    }
}
