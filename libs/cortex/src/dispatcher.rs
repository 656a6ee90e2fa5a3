//! Routes runner events to their handler chains.
//!
//! Chains run in declared order; a handler that mutates the event's
//! side-channel (order classification) completes before later handlers of
//! the same chain observe it. Handlers never propagate errors upward: a
//! failing handler annotates the event or logs, and the chain for other
//! events is unaffected.

use std::sync::Arc;

use funpay_client::Event;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cortex::Cortex;
use crate::handlers;

/// Consumes the runner's event channel until the generation token moves.
pub async fn run_dispatcher(cortex: Arc<Cortex>, mut rx: mpsc::Receiver<Event>, my_generation: u64) {
    while let Some(event) = rx.recv().await {
        if cortex.state.generation() != my_generation {
            debug!("dispatcher generation changed, stopping");
            break;
        }
        if !cortex.state.is_healthy() {
            // Degraded: the runner is being torn down; drop the backlog.
            continue;
        }
        dispatch(&cortex, event).await;
    }
}

pub async fn dispatch(cortex: &Arc<Cortex>, event: Event) {
    match event {
        Event::InitialChat { chat, .. } => {
            handlers::messages::save_initial_chat(cortex, &chat);
        }
        Event::ChatsListChanged { .. } => {}
        Event::LastChatMessageChanged { tag, chat } => {
            if cortex.old_mode_enabled() {
                handlers::messages::handle_legacy_chat_message(cortex, &tag, &chat).await;
            }
        }
        Event::NewMessage(event) => {
            if !cortex.old_mode_enabled() {
                handlers::messages::handle_new_message(cortex, &event).await;
            }
        }
        Event::InitialOrder { .. } => {}
        Event::OrdersListChanged { tag, .. } => {
            handlers::orders::schedule_profile_refresh(cortex, &tag);
        }
        Event::NewOrder(event) => {
            handlers::orders::handle_new_order(cortex, event).await;
        }
        Event::OrderStatusChanged { tag, order } => {
            handlers::orders::handle_status_changed(cortex, &tag, &order).await;
        }
    }
}
