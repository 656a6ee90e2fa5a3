//! Long-poll runner: one logical task that turns the marketplace's update
//! endpoint into a stream of typed [`Event`]s.
//!
//! Cursor discipline: for every chat the runner remembers the last seen
//! `node_msg_id` and only emits messages with a greater id, advancing the
//! cursor to the maximum id it emitted. A missed history fetch is a missed
//! notification, never a protocol desync, so cursors are not rolled back.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::account::{random_tag, Account};
use crate::error::{ClientError, Result};
use crate::events::{Event, MessageEventsStack, NewMessageEvent, NewOrderEvent};
use crate::html;
use crate::types::{ChatShortcut, OrderCounters, OrderShortcut, OrderStatus};

const HISTORY_FETCH_ATTEMPTS: u32 = 3;
const HISTORY_FETCH_GAP: Duration = Duration::from_secs(1);
const MAX_CONSECUTIVE_ERRORS: u32 = 5;
const NETWORK_RETRY_GAP: Duration = Duration::from_secs(5);

/// State the send path needs to feed back into the runner: message ids we
/// produced ourselves and cursor bumps for chats we just wrote to.
#[derive(Default)]
pub struct RunnerHandle {
    last_activity: AtomicI64,
    by_bot_ids: Mutex<HashMap<i64, Vec<i64>>>,
    /// chat id -> (node_msg_id, user_msg_id, last text) for snapshot dedup.
    last_messages: Mutex<HashMap<i64, (i64, i64, Option<String>)>>,
    /// chat id -> history-fetch cursor.
    last_message_ids: Mutex<HashMap<i64, i64>>,
}

impl RunnerHandle {
    /// Unix timestamp of the top of the last poll cycle; the watchdog reads
    /// this.
    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Acquire)
    }

    fn touch(&self) {
        self.last_activity
            .store(chrono::Utc::now().timestamp(), Ordering::Release);
    }

    /// Records a message id we sent so a later history fetch flags it as
    /// ours even without the bot marker.
    pub fn mark_as_by_bot(&self, chat_id: i64, message_id: i64) {
        if message_id > 0 {
            self.by_bot_ids
                .lock()
                .entry(chat_id)
                .or_default()
                .push(message_id);
        }
    }

    /// Advances both cursors after we wrote to a chat ourselves, so the next
    /// snapshot does not replay our own message.
    pub fn update_last_message(&self, chat_id: i64, message_id: i64, text: Option<String>) {
        if message_id <= 0 {
            return;
        }
        self.last_messages
            .lock()
            .insert(chat_id, (message_id, message_id, text));
        let mut ids = self.last_message_ids.lock();
        let entry = ids.entry(chat_id).or_insert(-1);
        if message_id > *entry {
            *entry = message_id;
        }
    }
}

struct HistoryRequest {
    chat_id: i64,
    name: String,
    from_id: i64,
    lcmc: ChatShortcut,
}

struct ChatDiff {
    events: Vec<Event>,
    pending_lcmc: Vec<ChatShortcut>,
    to_fetch: Vec<HistoryRequest>,
}

pub struct Runner {
    account: Arc<Account>,
    handle: Arc<RunnerHandle>,
    fetch_histories: bool,
    fetch_orders: bool,
    track_presence: bool,
    /// Max chats per batched history request.
    runner_len: usize,
    first_request: bool,
    msg_tag: String,
    order_tag: String,
    saved_orders: HashMap<String, OrderShortcut>,
    presence_queue: HashSet<i64>,
}

impl Runner {
    pub fn new(account: Arc<Account>, fetch_histories: bool, track_presence: bool) -> Self {
        Self {
            account,
            handle: Arc::new(RunnerHandle::default()),
            fetch_histories,
            fetch_orders: true,
            track_presence,
            runner_len: 10,
            first_request: true,
            msg_tag: random_tag(),
            order_tag: random_tag(),
            saved_orders: HashMap::new(),
            presence_queue: HashSet::new(),
        }
    }

    pub fn handle(&self) -> Arc<RunnerHandle> {
        Arc::clone(&self.handle)
    }

    async fn get_updates(&mut self) -> Result<Value> {
        let mut objects = vec![
            json!({
                "type": "orders_counters",
                "id": self.account.id().to_string(),
                "tag": self.order_tag,
                "data": false,
            }),
            json!({
                "type": "chat_bookmarks",
                "id": self.account.id().to_string(),
                "tag": self.msg_tag,
                "data": false,
            }),
        ];
        if self.track_presence {
            for id in &self.presence_queue {
                objects.push(json!({
                    "type": "c-p-u",
                    "id": id.to_string(),
                    "tag": random_tag(),
                    "data": false,
                }));
            }
        }
        debug!(tag = %self.msg_tag, "polling for updates");
        self.account
            .runner_request(Value::Array(objects), Value::Bool(false), true)
            .await
    }

    async fn parse_updates(&mut self, updates: Value) -> Vec<Event> {
        let mut events = Vec::new();
        let Some(objects) = updates["objects"].as_array() else {
            return events;
        };

        // orders_counters first: order diffing must not observe chats of a
        // newer snapshot than the order list it compares against.
        let mut sorted: Vec<&Value> = objects.iter().collect();
        sorted.sort_by_key(|o| o["type"].as_str() != Some("orders_counters"));

        for obj in sorted {
            match obj["type"].as_str() {
                Some("orders_counters") => {
                    events.extend(self.parse_order_updates(obj).await);
                }
                Some("chat_bookmarks") => {
                    events.extend(self.parse_chat_updates(obj).await);
                }
                // Presence responses carry nothing the pipeline consumes.
                _ => {}
            }
        }
        self.first_request = false;
        events
    }

    async fn parse_chat_updates(&mut self, obj: &Value) -> Vec<Event> {
        if let Some(tag) = obj["tag"].as_str() {
            self.msg_tag = tag.to_owned();
        }
        let chats = obj["data"]["html"]
            .as_str()
            .map(html::parse_contact_items)
            .unwrap_or_default();
        let diff = self.diff_chat_snapshot(chats);
        let ChatDiff {
            mut events,
            pending_lcmc,
            to_fetch,
        } = diff;

        if to_fetch.is_empty() {
            events.extend(pending_lcmc.into_iter().map(|chat| {
                Event::LastChatMessageChanged {
                    tag: self.msg_tag.clone(),
                    chat,
                }
            }));
            return events;
        }

        debug!(chats = to_fetch.len(), "new messages detected");
        if self.track_presence {
            for req in &to_fetch {
                if let Some(id) = self.account.interlocutor_id(req.chat_id) {
                    self.presence_queue.insert(id);
                }
            }
        }

        for pack in to_fetch.chunks(self.runner_len) {
            let histories = self.fetch_pack(pack).await;
            for req in pack {
                events.push(Event::LastChatMessageChanged {
                    tag: self.msg_tag.clone(),
                    chat: req.lcmc.clone(),
                });
                if let Some(stack) = histories.get(&req.chat_id) {
                    for message in stack.messages() {
                        events.push(Event::NewMessage(NewMessageEvent {
                            tag: self.msg_tag.clone(),
                            message: message.clone(),
                            stack: stack.clone(),
                        }));
                    }
                }
            }
        }
        events
    }

    /// Compares a chat snapshot against the cursors, emitting initial/seed
    /// events and collecting history fetch requests.
    fn diff_chat_snapshot(&mut self, chats: Vec<ChatShortcut>) -> ChatDiff {
        let mut events = Vec::new();
        let mut pending_lcmc = Vec::new();
        let mut to_fetch = Vec::new();

        for chat in chats {
            let prev_node = self
                .handle
                .last_messages
                .lock()
                .get(&chat.id)
                .map(|(node, _, _)| *node)
                .unwrap_or(-1);
            if chat.node_msg_id == prev_node {
                continue;
            }

            let stored_text = (!crate::patterns::is_image_placeholder(&chat.last_message_text))
                .then(|| chat.last_message_text.clone());
            self.account.add_chats(std::slice::from_ref(&chat));
            self.handle.last_messages.lock().insert(
                chat.id,
                (chat.node_msg_id, chat.user_msg_id, stored_text),
            );

            if self.first_request {
                if self.fetch_histories {
                    self.handle
                        .last_message_ids
                        .lock()
                        .insert(chat.id, chat.node_msg_id);
                }
                events.push(Event::InitialChat {
                    tag: self.msg_tag.clone(),
                    chat,
                });
                continue;
            }

            let from_id = self
                .handle
                .last_message_ids
                .lock()
                .get(&chat.id)
                .copied()
                .unwrap_or(-1);
            if self.fetch_histories && chat.node_msg_id > from_id {
                self.handle
                    .last_message_ids
                    .lock()
                    .insert(chat.id, chat.node_msg_id);
                to_fetch.push(HistoryRequest {
                    chat_id: chat.id,
                    name: chat.name.clone(),
                    from_id,
                    lcmc: chat,
                });
            } else {
                pending_lcmc.push(chat);
            }
        }

        if !pending_lcmc.is_empty() || !to_fetch.is_empty() {
            events.push(Event::ChatsListChanged {
                tag: self.msg_tag.clone(),
            });
        }
        ChatDiff {
            events,
            pending_lcmc,
            to_fetch,
        }
    }

    /// Fetches one pack of chat histories, with a residual presence
    /// sub-request filling the batch up to `runner_len`.
    async fn fetch_pack(&mut self, pack: &[HistoryRequest]) -> HashMap<i64, MessageEventsStack> {
        let chats: Vec<(i64, String)> = pack
            .iter()
            .map(|r| (r.chat_id, r.name.clone()))
            .collect();
        let mut presence = Vec::new();
        while self.track_presence && chats.len() + presence.len() < self.runner_len {
            let Some(&id) = self.presence_queue.iter().next() else {
                break;
            };
            self.presence_queue.remove(&id);
            presence.push(id);
        }

        let mut histories = None;
        for attempt in 1..=HISTORY_FETCH_ATTEMPTS {
            match self.account.get_chat_histories(&chats, &presence).await {
                Ok(h) => {
                    histories = Some(h);
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "chat history fetch failed");
                    tokio::time::sleep(HISTORY_FETCH_GAP).await;
                }
            }
        }
        let Some(histories) = histories else {
            error!(
                chats = ?chats.iter().map(|(id, _)| id).collect::<Vec<_>>(),
                "chat history fetch failed: attempts exhausted"
            );
            return HashMap::new();
        };

        let mut stacks = HashMap::new();
        for req in pack {
            let Some(messages) = histories.get(&req.chat_id) else {
                continue;
            };
            let mut fresh: Vec<_> = messages
                .iter()
                .filter(|m| m.id > req.from_id)
                .cloned()
                .collect();
            if fresh.is_empty() {
                continue;
            }

            {
                let mut by_bot = self.handle.by_bot_ids.lock();
                let ids = by_bot.entry(req.chat_id).or_default();
                for message in &mut fresh {
                    if !message.by_bot && ids.contains(&message.id) {
                        message.by_bot = true;
                    }
                }
                let last_id = fresh.last().map(|m| m.id).unwrap_or(-1);
                ids.retain(|id| *id > last_id);
            }

            stacks.insert(req.chat_id, MessageEventsStack::new(fresh));
        }
        stacks
    }

    async fn parse_order_updates(&mut self, obj: &Value) -> Vec<Event> {
        if let Some(tag) = obj["tag"].as_str() {
            self.order_tag = tag.to_owned();
        }
        let mut events = Vec::new();
        if !self.first_request {
            events.push(Event::OrdersListChanged {
                tag: self.order_tag.clone(),
                counters: OrderCounters {
                    buyer: obj["data"]["buyer"].as_u64().unwrap_or(0) as u32,
                    seller: obj["data"]["seller"].as_u64().unwrap_or(0) as u32,
                },
            });
        }
        if !self.fetch_orders {
            return events;
        }

        debug!("refreshing the sales list");
        let mut orders = None;
        for attempt in 1..=HISTORY_FETCH_ATTEMPTS {
            match self.account.get_sales(None).await {
                Ok(page) => {
                    orders = Some(page.orders);
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "sales list fetch failed");
                    tokio::time::sleep(HISTORY_FETCH_GAP).await;
                }
            }
        }
        let Some(orders) = orders else {
            error!("sales list fetch failed: attempts exhausted");
            return events;
        };
        events.extend(self.diff_orders(orders));
        events
    }

    /// Diffs a freshly fetched sales list against the saved one.
    fn diff_orders(&mut self, orders: Vec<OrderShortcut>) -> Vec<Event> {
        let mut events = Vec::new();
        let mut fresh = HashMap::new();
        for order in orders {
            match self.saved_orders.get(&order.id) {
                None => {
                    if self.first_request {
                        events.push(Event::InitialOrder {
                            tag: self.order_tag.clone(),
                            order: order.clone(),
                        });
                    } else {
                        events.push(Event::NewOrder(NewOrderEvent {
                            tag: self.order_tag.clone(),
                            order: order.clone(),
                        }));
                        if order.status == OrderStatus::Closed {
                            events.push(Event::OrderStatusChanged {
                                tag: self.order_tag.clone(),
                                order: order.clone(),
                            });
                        }
                    }
                }
                Some(saved) if saved.status != order.status => {
                    events.push(Event::OrderStatusChanged {
                        tag: self.order_tag.clone(),
                        order: order.clone(),
                    });
                }
                Some(_) => {}
            }
            fresh.insert(order.id.clone(), order);
        }
        self.saved_orders = fresh;
        events
    }

    /// The poll loop. Emits events into `tx` until the generation token
    /// changes (graceful stop) or the error budget is exhausted (returns
    /// the escalating error for the supervisor).
    pub async fn listen(
        mut self,
        tx: mpsc::Sender<Event>,
        requests_delay: f64,
        generation: Arc<AtomicU64>,
        my_generation: u64,
    ) -> Result<()> {
        let mut consecutive_errors: u32 = 0;
        loop {
            if generation.load(Ordering::Acquire) != my_generation {
                info!("runner generation changed, stopping");
                return Ok(());
            }
            self.handle.touch();

            let jitter = requests_delay * 0.2;
            let sleep_time = rand::thread_rng()
                .gen_range((requests_delay - jitter).max(0.5)..=requests_delay + jitter);

            match self.get_updates().await {
                Ok(updates) => {
                    let events = self.parse_updates(updates).await;
                    for event in events {
                        if tx.send(event).await.is_err() {
                            info!("event channel closed, stopping runner");
                            return Ok(());
                        }
                    }
                    if consecutive_errors > 0 {
                        info!("connection to the marketplace restored in the runner");
                    }
                    consecutive_errors = 0;
                }
                Err(ClientError::Unauthorized) => return Err(ClientError::Unauthorized),
                Err(e @ ClientError::Network(_)) => {
                    consecutive_errors += 1;
                    error!(error = %e, "network error in runner ({consecutive_errors}/{MAX_CONSECUTIVE_ERRORS})");
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        return Err(e);
                    }
                    tokio::time::sleep(NETWORK_RETRY_GAP).await;
                    continue;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(error = %e, "runner update failed ({consecutive_errors}/{MAX_CONSECUTIVE_ERRORS})");
                    if e.is_connection_dropped() || consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        return Err(e);
                    }
                    let extra = rand::thread_rng().gen_range(2.0..7.0);
                    tokio::time::sleep(Duration::from_secs_f64(sleep_time + extra)).await;
                }
            }

            debug!(seconds = sleep_time, "runner sleeping");
            tokio::time::sleep(Duration::from_secs_f64(sleep_time)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn chat(id: i64, node: i64, text: &str) -> ChatShortcut {
        ChatShortcut {
            id,
            name: format!("user{id}"),
            last_message_text: text.to_owned(),
            node_msg_id: node,
            user_msg_id: node,
            unread: true,
            last_by_bot: false,
            last_by_vertex: false,
            html: String::new(),
        }
    }

    fn order(id: &str, status: OrderStatus) -> OrderShortcut {
        OrderShortcut {
            id: id.to_owned(),
            description: "Gold".to_owned(),
            subcategory_name: "Gold, WoW".to_owned(),
            subcategory_id: Some(1),
            price: 10.0,
            currency: crate::types::Currency::Rub,
            buyer_username: "buyer".to_owned(),
            buyer_id: 5,
            chat_id: 100,
            status,
            date: Utc::now(),
            amount: 1,
            html: String::new(),
        }
    }

    fn test_runner() -> Runner {
        let account = Account::new("key", "agent", None).unwrap();
        Runner::new(Arc::new(account), true, false)
    }

    #[test]
    fn first_cycle_seeds_cursors_and_emits_initial_chats() {
        let mut runner = test_runner();
        let diff = runner.diff_chat_snapshot(vec![chat(100, 500, "hi")]);
        assert_eq!(diff.events.len(), 1);
        assert!(matches!(diff.events[0], Event::InitialChat { .. }));
        assert!(diff.to_fetch.is_empty());
        assert_eq!(
            runner.handle.last_message_ids.lock().get(&100).copied(),
            Some(500)
        );
    }

    #[test]
    fn repeated_node_msg_is_skipped() {
        let mut runner = test_runner();
        runner.diff_chat_snapshot(vec![chat(100, 500, "hi")]);
        runner.first_request = false;

        // Same snapshot again: no events, nothing queued.
        let diff = runner.diff_chat_snapshot(vec![chat(100, 500, "hi")]);
        assert!(diff.events.is_empty());
        assert!(diff.to_fetch.is_empty());
        assert!(diff.pending_lcmc.is_empty());
    }

    #[test]
    fn advanced_node_msg_queues_history_fetch_from_previous_cursor() {
        let mut runner = test_runner();
        runner.diff_chat_snapshot(vec![chat(100, 500, "hi")]);
        runner.first_request = false;

        let diff = runner.diff_chat_snapshot(vec![chat(100, 510, "more")]);
        assert_eq!(diff.to_fetch.len(), 1);
        assert_eq!(diff.to_fetch[0].from_id, 500);
        // Cursor is advanced eagerly; a second identical snapshot is a no-op.
        let again = runner.diff_chat_snapshot(vec![chat(100, 510, "more")]);
        assert!(again.to_fetch.is_empty());
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let mut runner = test_runner();
        runner.diff_chat_snapshot(vec![chat(100, 500, "hi")]);
        runner.first_request = false;
        runner.diff_chat_snapshot(vec![chat(100, 510, "a")]);

        // A stale snapshot with a lower node id emits only the legacy
        // last-message event, never a fetch below the cursor.
        let diff = runner.diff_chat_snapshot(vec![chat(100, 505, "old")]);
        assert!(diff.to_fetch.is_empty());
        assert_eq!(diff.pending_lcmc.len(), 1);
        assert_eq!(
            runner.handle.last_message_ids.lock().get(&100).copied(),
            Some(510)
        );
    }

    #[test]
    fn first_cycle_orders_are_initial() {
        let mut runner = test_runner();
        let events = runner.diff_orders(vec![order("AAAA1111", OrderStatus::Paid)]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::InitialOrder { .. }));
    }

    #[test]
    fn new_closed_order_also_emits_status_change() {
        let mut runner = test_runner();
        runner.diff_orders(vec![]);
        runner.first_request = false;

        let events = runner.diff_orders(vec![order("AAAA1111", OrderStatus::Closed)]);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::NewOrder(_)));
        assert!(matches!(events[1], Event::OrderStatusChanged { .. }));
    }

    #[test]
    fn status_transition_emits_single_change() {
        let mut runner = test_runner();
        runner.diff_orders(vec![order("AAAA1111", OrderStatus::Paid)]);
        runner.first_request = false;

        let events = runner.diff_orders(vec![order("AAAA1111", OrderStatus::Refunded)]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::OrderStatusChanged { .. }));

        // Unchanged snapshot produces nothing.
        let events = runner.diff_orders(vec![order("AAAA1111", OrderStatus::Refunded)]);
        assert!(events.is_empty());
    }

    #[test]
    fn own_send_advances_cursor_and_marks_by_bot() {
        let runner = test_runner();
        let handle = runner.handle();
        handle.update_last_message(100, 600, Some("sent".to_owned()));
        handle.mark_as_by_bot(100, 600);
        assert_eq!(
            handle.last_message_ids.lock().get(&100).copied(),
            Some(600)
        );
        assert!(handle.by_bot_ids.lock().get(&100).unwrap().contains(&600));
    }
}
