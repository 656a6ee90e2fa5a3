//! The owning coordinator value: configuration, shared caches, connection
//! state and the send path. Constructed once at process start and passed by
//! `Arc` to every subsystem.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bot_config::stores::{Blacklist, ForecastEntry, OldUsers, WithdrawalForecast};
use bot_config::{AutoDeliveryConfig, AutoResponseConfig, MainConfig};
use funpay_client::error::ClientError;
use funpay_client::runner::RunnerHandle;
use funpay_client::types::{Balance, Currency, Order, OrderShortcut, Profile};
use funpay_client::Account;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::control_plane::{ControlPlane, NotificationKind};
use crate::expander::{self, Entity};
use crate::paths::BasePaths;
use crate::pool::WorkerPool;

/// Sentinel order id used by operator-triggered delivery tests; it must
/// never be resolved upstream or refunded.
pub const TEST_ORDER_ID: &str = "ADTEST";

const ORDER_CACHE_TTL: Duration = Duration::from_secs(3600);
const PROFILE_CACHE_TTL: Duration = Duration::from_secs(120);
const EXCHANGE_RATE_MIN_INTERVAL: Duration = Duration::from_secs(60);
const NOTIFIED_MESSAGES_CAP: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedReason {
    ProxyMissing,
    ProxyDead,
    ProxyBlocked,
    Credentials,
    Network,
    Upstream,
}

impl DegradedReason {
    pub fn label(&self) -> &'static str {
        match self {
            DegradedReason::ProxyMissing => "proxy-missing",
            DegradedReason::ProxyDead => "proxy-dead",
            DegradedReason::ProxyBlocked => "proxy-blocked",
            DegradedReason::Credentials => "credentials",
            DegradedReason::Network => "network",
            DegradedReason::Upstream => "upstream",
        }
    }
}

/// Connection state shared between the supervisor and the worker loops.
#[derive(Default)]
pub struct ConnectionState {
    healthy: AtomicBool,
    degraded: AtomicBool,
    degraded_since: Mutex<Option<i64>>,
    reason: Mutex<Option<DegradedReason>>,
    /// Bumped on every supervisor transition; long-lived loops check their
    /// snapshot against it and stop when it moves.
    generation: Arc<AtomicU64>,
    pub wake: Notify,
}

impl ConnectionState {
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn degraded_since(&self) -> Option<i64> {
        *self.degraded_since.lock()
    }

    pub fn degraded_reason(&self) -> Option<DegradedReason> {
        *self.reason.lock()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Shared token handed to the runner so it can observe transitions.
    pub fn generation_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.generation)
    }
}

pub struct Cortex {
    /// Swappable: the supervisor rebuilds the account when the operator
    /// replaces the session token or the proxy.
    account: RwLock<Arc<Account>>,
    pub paths: BasePaths,
    pub pool: WorkerPool,
    pub bridge: ControlPlane,
    pub state: ConnectionState,

    pub main_cfg: RwLock<MainConfig>,
    pub auto_response: RwLock<AutoResponseConfig>,
    pub auto_delivery: RwLock<AutoDeliveryConfig>,
    pub blacklist: RwLock<Blacklist>,

    /// Greeting gate table; the mutex doubles as the gate's critical
    /// section, so eligibility check and mark-as-seen are atomic.
    pub old_users: Mutex<OldUsers>,
    pub withdrawal_forecast: Mutex<WithdrawalForecast>,

    /// One-shot auto-delivery test keys: key -> lot title.
    delivery_tests: Mutex<HashMap<String, String>>,

    order_cache: Mutex<HashMap<String, (Order, Instant)>>,
    exchange_rates: Mutex<HashMap<(Currency, Currency), (f64, Instant)>>,

    /// Startup/TTL profile snapshot (the raise scheduler's view).
    profile: RwLock<Option<Arc<Profile>>>,
    profile_fetched_at: Mutex<Option<Instant>>,
    /// Snapshot refreshed after every order-list change (the lot-state
    /// sweep's view), tagged with the runner tag that triggered it.
    curr_profile: RwLock<Option<Arc<Profile>>>,
    curr_profile_tag: Mutex<Option<String>>,
    last_state_change_tag: Mutex<Option<String>>,

    pub balance: Mutex<Option<Balance>>,

    /// category id -> unix time of the next allowed raise attempt.
    pub raise_times: Mutex<HashMap<i64, i64>>,
    /// category id -> unix time of the last successful raise.
    pub raised_times: Mutex<HashMap<i64, i64>>,

    runner_handle: Mutex<Option<Arc<RunnerHandle>>>,
    notified_messages: Mutex<(HashSet<(i64, i64)>, VecDeque<(i64, i64)>)>,
    pub start_time: i64,
}

impl Cortex {
    pub fn new(
        account: Arc<Account>,
        paths: BasePaths,
        bridge: ControlPlane,
        main_cfg: MainConfig,
        auto_response: AutoResponseConfig,
        auto_delivery: AutoDeliveryConfig,
    ) -> Arc<Self> {
        let now = chrono::Utc::now().timestamp();
        let blacklist = Blacklist::load(paths.blacklist());
        let old_users = OldUsers::load(
            paths.old_users(),
            main_cfg.greetings.greetings_cooldown,
            now,
        );
        let forecast = WithdrawalForecast::load(paths.withdrawal_forecast(), now);
        Arc::new(Self {
            account: RwLock::new(account),
            pool: WorkerPool::default(),
            bridge,
            state: ConnectionState::default(),
            main_cfg: RwLock::new(main_cfg),
            auto_response: RwLock::new(auto_response),
            auto_delivery: RwLock::new(auto_delivery),
            blacklist: RwLock::new(blacklist),
            old_users: Mutex::new(old_users),
            withdrawal_forecast: Mutex::new(forecast),
            delivery_tests: Mutex::new(HashMap::new()),
            order_cache: Mutex::new(HashMap::new()),
            exchange_rates: Mutex::new(HashMap::new()),
            profile: RwLock::new(None),
            profile_fetched_at: Mutex::new(None),
            curr_profile: RwLock::new(None),
            curr_profile_tag: Mutex::new(None),
            last_state_change_tag: Mutex::new(None),
            balance: Mutex::new(None),
            raise_times: Mutex::new(HashMap::new()),
            raised_times: Mutex::new(HashMap::new()),
            runner_handle: Mutex::new(None),
            notified_messages: Mutex::new((HashSet::new(), VecDeque::new())),
            start_time: now,
            paths,
        })
    }

    /// Current account handle; do not hold across awaits that may outlive
    /// a supervisor transition.
    pub fn account(&self) -> Arc<Account> {
        self.account.read().clone()
    }

    pub fn replace_account(&self, account: Arc<Account>) {
        *self.account.write() = account;
    }

    // -- feature toggles -------------------------------------------------

    pub fn autoraise_enabled(&self) -> bool {
        self.main_cfg.read().funpay.auto_raise
    }

    pub fn autoresponse_enabled(&self) -> bool {
        self.main_cfg.read().funpay.auto_response
    }

    pub fn autodelivery_enabled(&self) -> bool {
        self.main_cfg.read().funpay.auto_delivery
    }

    pub fn multidelivery_enabled(&self) -> bool {
        self.main_cfg.read().funpay.multi_delivery
    }

    pub fn autorestore_enabled(&self) -> bool {
        self.main_cfg.read().funpay.auto_restore
    }

    pub fn autodisable_enabled(&self) -> bool {
        self.main_cfg.read().funpay.auto_disable
    }

    pub fn old_mode_enabled(&self) -> bool {
        self.main_cfg.read().funpay.old_msg_get_mode
    }

    pub fn is_blacklisted(&self, username: &str) -> bool {
        self.blacklist.read().contains(username)
    }

    // -- runner wiring ---------------------------------------------------

    pub fn set_runner_handle(&self, handle: Arc<RunnerHandle>) {
        *self.runner_handle.lock() = Some(handle);
    }

    pub fn runner_handle(&self) -> Option<Arc<RunnerHandle>> {
        self.runner_handle.lock().clone()
    }

    /// Stack-level notification dedup; true when this message id has not
    /// been notified yet.
    pub fn mark_notified(&self, chat_id: i64, message_id: i64) -> bool {
        let mut guard = self.notified_messages.lock();
        let (set, queue) = &mut *guard;
        if !set.insert((chat_id, message_id)) {
            return false;
        }
        queue.push_back((chat_id, message_id));
        while queue.len() > NOTIFIED_MESSAGES_CAP {
            if let Some(old) = queue.pop_front() {
                set.remove(&old);
            }
        }
        true
    }

    // -- send path -------------------------------------------------------

    /// Expands and sends a message body to a chat, chunk by chunk.
    ///
    /// Returns the messages that were actually posted; `None` means the
    /// template expanded to nothing sendable or the account is not ready.
    /// Each chunk is retried three times; an HTTP 400 asking to refresh the
    /// page triggers one session refresh and exactly one extra attempt.
    pub async fn send_message(
        &self,
        chat_id: i64,
        body: &str,
        chat_name: Option<&str>,
        interlocutor_id: Option<i64>,
        watermark: bool,
    ) -> Option<Vec<funpay_client::types::Message>> {
        if !self.account().is_initiated() {
            warn!(chat_id, "send skipped: account not initiated yet");
            return None;
        }

        let (watermark_text, keep_unread) = {
            let cfg = self.main_cfg.read();
            (
                cfg.other.watermark.clone(),
                cfg.funpay.keep_sent_messages_unread,
            )
        };
        let body = if watermark && !watermark_text.is_empty() && !body.trim_start().starts_with("$photo=")
        {
            format!("{watermark_text}\n{body}")
        } else {
            body.to_owned()
        };

        let entities = expander::parse_message_entities(&body);
        if entities.is_empty() || entities.iter().all(|e| matches!(e, Entity::Sleep(_))) {
            return None;
        }

        let interlocutor = interlocutor_id.or_else(|| self.account().interlocutor_id(chat_id));
        let mut sent = Vec::new();
        for entity in entities {
            match entity {
                Entity::Sleep(secs) => {
                    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                }
                Entity::Text(chunk) => {
                    match self
                        .send_chunk(chat_id, &chunk, chat_name, interlocutor, None, keep_unread)
                        .await
                    {
                        Some(msg) => sent.push(msg),
                        None => return Some(sent),
                    }
                }
                Entity::Photo(image_id) => {
                    match self
                        .send_chunk(chat_id, "", chat_name, interlocutor, Some(image_id), keep_unread)
                        .await
                    {
                        Some(msg) => sent.push(msg),
                        None => return Some(sent),
                    }
                }
            }
        }
        Some(sent)
    }

    async fn send_chunk(
        &self,
        chat_id: i64,
        text: &str,
        chat_name: Option<&str>,
        interlocutor_id: Option<i64>,
        image_id: Option<i64>,
        keep_unread: bool,
    ) -> Option<funpay_client::types::Message> {
        let mut attempts = 3;
        let mut session_refreshed = false;
        while attempts > 0 {
            let result = self
                .account()
                .send_message(chat_id, text, chat_name, interlocutor_id, image_id, keep_unread)
                .await;
            match result {
                Ok(message) => {
                    info!(chat_id, "message sent");
                    if let Some(handle) = self.runner_handle() {
                        handle.mark_as_by_bot(chat_id, message.id);
                        handle.update_last_message(
                            chat_id,
                            message.id,
                            (!text.is_empty()).then(|| text.to_owned()),
                        );
                    }
                    return Some(message);
                }
                Err(ClientError::RequestFailed { status: 400, body })
                    if !session_refreshed
                        && (body.contains("Обновите страницу") || body.contains("Refresh")) =>
                {
                    warn!(chat_id, "stale session on send, refreshing once");
                    session_refreshed = true;
                    if self.update_session().await {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    attempts -= 1;
                }
                Err(e) => {
                    warn!(chat_id, error = %e, "message send failed, {attempts} attempts left");
                    attempts -= 1;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        error!(chat_id, "message send failed: attempts exhausted");
        None
    }

    /// Refreshes the session cookie, 3 tries with a 2 s gap.
    pub async fn update_session(&self) -> bool {
        if !self.state.is_healthy() {
            return false;
        }
        for attempt in 1..=3 {
            match self.account().get(true).await {
                Ok(()) => {
                    info!("session refreshed");
                    return true;
                }
                Err(e) => {
                    error!(attempt, error = %e, "session refresh failed");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
        false
    }

    // -- orders ----------------------------------------------------------

    /// Resolves a full order by id with a one-hour cache. Never resolves
    /// the delivery-test sentinel.
    pub async fn resolve_order(&self, order_id: &str) -> Option<Order> {
        if order_id == TEST_ORDER_ID {
            return None;
        }
        {
            let cache = self.order_cache.lock();
            if let Some((order, fetched_at)) = cache.get(order_id) {
                if fetched_at.elapsed() < ORDER_CACHE_TTL {
                    info!(order_id, "using cached order");
                    return Some(order.clone());
                }
            }
        }
        for attempt in 1..=3u32 {
            match self.account().get_order(order_id).await {
                Ok(order) => {
                    self.order_cache
                        .lock()
                        .insert(order_id.to_owned(), (order.clone(), Instant::now()));
                    info!(order_id, "order fetched");
                    return Some(order);
                }
                Err(e) => {
                    warn!(order_id, attempt, error = %e, "order fetch failed");
                    if attempt < 3 {
                        let pause = rand::thread_rng().gen_range(0.5..1.5);
                        tokio::time::sleep(Duration::from_secs_f64(pause)).await;
                    }
                }
            }
        }
        None
    }

    /// Status changes invalidate the cached order so review handling never
    /// sees a stale snapshot.
    pub fn invalidate_order_cache(&self, order_id: &str) {
        self.order_cache.lock().remove(order_id);
    }

    pub fn record_withdrawal(&self, order: &OrderShortcut) {
        let entry = ForecastEntry {
            completed_at: chrono::Utc::now().timestamp(),
            price: order.price,
            currency: order.currency.to_string(),
        };
        let mut forecast = self.withdrawal_forecast.lock();
        if let Err(e) = forecast.record(order.id.clone(), entry) {
            warn!(order_id = %order.id, error = %e, "failed to persist withdrawal forecast");
        }
        let _ = forecast.evict_older_than(chrono::Utc::now().timestamp());
    }

    // -- exchange rates --------------------------------------------------

    /// Rate converting `base` into `target`, cached per pair for at least a
    /// minute.
    ///
    /// The marketplace reports rates relative to the account's displayed
    /// currency, which can switch between calls; two probes are reconciled
    /// to pin the pair down.
    pub async fn get_exchange_rate(&self, base: Currency, target: Currency) -> Option<f64> {
        if base == Currency::Unknown || target == Currency::Unknown {
            return None;
        }
        if base == target {
            return Some(1.0);
        }
        {
            let rates = self.exchange_rates.lock();
            if let Some((rate, at)) = rates.get(&(base, target)) {
                if at.elapsed() < EXCHANGE_RATE_MIN_INTERVAL {
                    return Some(*rate);
                }
            }
            if let Some((reverse, at)) = rates.get(&(target, base)) {
                if at.elapsed() < EXCHANGE_RATE_MIN_INTERVAL && *reverse != 0.0 {
                    return Some(1.0 / reverse);
                }
            }
        }

        for attempt in 1..=3u32 {
            let probe = self.probe_exchange_rate(base, target).await;
            match probe {
                Ok(Some(rate)) => {
                    let mut rates = self.exchange_rates.lock();
                    rates.insert((base, target), (rate, Instant::now()));
                    if rate != 0.0 {
                        rates.insert((target, base), (1.0 / rate, Instant::now()));
                    }
                    return Some(rate);
                }
                Ok(None) => {
                    warn!(attempt, "account currency switched mid-probe, retrying");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "exchange rate probe failed");
                }
            }
            if attempt < 3 {
                let pause = rand::thread_rng().gen_range(1.0..2.0);
                tokio::time::sleep(Duration::from_secs_f64(pause)).await;
            }
        }
        error!("failed to get exchange rate after attempts");
        None
    }

    /// One two-probe reconciliation round. `Ok(None)` means the account
    /// currency flipped between the probes and the round is inconclusive.
    async fn probe_exchange_rate(
        &self,
        base: Currency,
        target: Currency,
    ) -> funpay_client::Result<Option<f64>> {
        let (rate_to_base, acc_after_base) = self.account().get_exchange_rate(base).await?;
        {
            let mut rates = self.exchange_rates.lock();
            rates.insert((acc_after_base, base), (rate_to_base, Instant::now()));
            if rate_to_base != 0.0 {
                rates.insert((base, acc_after_base), (1.0 / rate_to_base, Instant::now()));
            }
        }
        let pause = rand::thread_rng().gen_range(0.5..1.0);
        tokio::time::sleep(Duration::from_secs_f64(pause)).await;
        let (rate_to_target, acc_after_target) = self.account().get_exchange_rate(target).await?;
        {
            let mut rates = self.exchange_rates.lock();
            rates.insert((acc_after_target, target), (rate_to_target, Instant::now()));
            if rate_to_target != 0.0 {
                rates.insert(
                    (target, acc_after_target),
                    (1.0 / rate_to_target, Instant::now()),
                );
            }
        }

        if acc_after_base == base {
            Ok(Some(rate_to_target))
        } else if acc_after_target == target {
            if rate_to_base == 0.0 {
                Ok(Some(f64::INFINITY))
            } else {
                Ok(Some(1.0 / rate_to_base))
            }
        } else if acc_after_base == acc_after_target {
            if rate_to_base == 0.0 {
                Ok(Some(f64::INFINITY))
            } else {
                Ok(Some(rate_to_target / rate_to_base))
            }
        } else {
            Ok(None)
        }
    }

    // -- profile snapshots -----------------------------------------------

    pub fn profile(&self) -> Option<Arc<Profile>> {
        self.profile.read().clone()
    }

    pub fn curr_profile(&self) -> Option<Arc<Profile>> {
        self.curr_profile.read().clone()
    }

    pub fn curr_profile_tag(&self) -> Option<String> {
        self.curr_profile_tag.lock().clone()
    }

    /// Startup/TTL profile fetch. `attempts` is 5 at startup, lower on
    /// demand.
    pub async fn refresh_profile(&self, attempts: u32, force: bool) -> bool {
        if !force {
            let fetched_at = self.profile_fetched_at.lock();
            if let Some(at) = *fetched_at {
                if at.elapsed() < PROFILE_CACHE_TTL {
                    return true;
                }
            }
        }
        for attempt in 1..=attempts {
            match self.account().get_user(self.account().id()).await {
                Ok(profile) => {
                    *self.profile.write() = Some(Arc::new(profile));
                    *self.profile_fetched_at.lock() = Some(Instant::now());
                    info!("profile refreshed");
                    return true;
                }
                Err(ClientError::Unauthorized) => {
                    error!("profile refresh rejected: unauthorized");
                    return false;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "profile refresh failed");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
        error!("profile refresh failed: attempts exhausted");
        false
    }

    /// Order-triggered background profile refresh; tagged so the lot-state
    /// sweep can tell whether it already observed this cycle.
    pub async fn refresh_current_profile(&self, tag: &str, attempts: u32) -> bool {
        for attempt in 1..=attempts {
            match self.account().get_user(self.account().id()).await {
                Ok(profile) => {
                    *self.curr_profile.write() = Some(Arc::new(profile));
                    *self.curr_profile_tag.lock() = Some(tag.to_owned());
                    return true;
                }
                Err(ClientError::Unauthorized) => return false,
                Err(e) => {
                    warn!(attempt, error = %e, "background lot refresh failed");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
        error!("background lot refresh failed: attempts exhausted");
        false
    }

    /// Claims the lot-state sweep for a runner cycle; false when another
    /// task already ran it for this tag.
    pub fn claim_state_change(&self, tag: &str) -> bool {
        let mut last = self.last_state_change_tag.lock();
        if last.as_deref() == Some(tag) {
            return false;
        }
        *last = Some(tag.to_owned());
        true
    }

    // -- balance ---------------------------------------------------------

    /// Balance probe off one of our own common lots, 3 tries.
    pub async fn fetch_balance(&self) -> Option<Balance> {
        let profile = self.profile()?;
        let lot_id = profile.common_lots().next()?.id;
        for attempt in 1..=3u32 {
            match self.account().get_balance(lot_id).await {
                Ok(balance) => {
                    *self.balance.lock() = Some(balance);
                    return Some(balance);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "balance probe failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        None
    }

    // -- delivery tests --------------------------------------------------

    pub fn register_delivery_test(&self, key: String, lot_title: String) {
        self.delivery_tests.lock().insert(key, lot_title);
    }

    /// Consumes a one-shot test key, returning the bound lot title.
    pub fn consume_delivery_test(&self, key: &str) -> Option<String> {
        self.delivery_tests.lock().remove(key)
    }

    // -- degraded mode ---------------------------------------------------

    /// Marks the connection degraded. The operator notification fires
    /// exactly once per contiguous degraded interval.
    pub fn enter_degraded(&self, reason: DegradedReason, operator_text: &str) {
        self.state.healthy.store(false, Ordering::Release);
        if !self.state.degraded.swap(true, Ordering::AcqRel) {
            error!(reason = reason.label(), "entering degraded mode");
            *self.state.reason.lock() = Some(reason);
            let mut since = self.state.degraded_since.lock();
            if since.is_none() {
                *since = Some(chrono::Utc::now().timestamp());
            }
            drop(since);
            self.bridge.notify(NotificationKind::Critical, operator_text);
        }
        self.state.wake.notify_waiters();
    }

    /// Marks the connection healthy again; sends a single restored
    /// notification when leaving a degraded interval.
    pub fn mark_healthy(&self) {
        let was_degraded = self.state.degraded.swap(false, Ordering::AcqRel);
        self.state.healthy.store(true, Ordering::Release);
        *self.state.degraded_since.lock() = None;
        *self.state.reason.lock() = None;
        if was_degraded {
            info!("connection to the marketplace restored");
            self.bridge.notify(
                NotificationKind::Critical,
                "Connection restored, resuming normal operation.",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cortex() -> Arc<Cortex> {
        let dir = tempfile::tempdir().unwrap();
        let paths = BasePaths::new(dir.path());
        paths.ensure_dirs().unwrap();
        let account = Arc::new(Account::new("key", "agent", None).unwrap());
        Cortex::new(
            account,
            paths,
            ControlPlane::disconnected(),
            MainConfig::default(),
            AutoResponseConfig::default(),
            AutoDeliveryConfig::default(),
        )
    }

    #[test]
    fn degraded_entry_notifies_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let paths = BasePaths::new(dir.path());
        paths.ensure_dirs().unwrap();
        let account = Arc::new(Account::new("key", "agent", None).unwrap());
        let (bridge, mut rx) = ControlPlane::channel();
        let cortex = Cortex::new(
            account,
            paths,
            bridge,
            MainConfig::default(),
            AutoResponseConfig::default(),
            AutoDeliveryConfig::default(),
        );

        cortex.enter_degraded(DegradedReason::Credentials, "creds gone");
        cortex.enter_degraded(DegradedReason::Credentials, "creds gone");
        cortex.enter_degraded(DegradedReason::ProxyDead, "proxy gone");
        cortex.mark_healthy();
        cortex.mark_healthy();

        let mut texts = Vec::new();
        while let Ok(n) = rx.try_recv() {
            texts.push(n.text);
        }
        // One degraded notification (re-entries silenced), one restored.
        assert_eq!(texts.len(), 2);
        assert_eq!(texts[0], "creds gone");
        assert!(texts[1].contains("restored"));
    }

    #[test]
    fn delivery_test_keys_are_single_use() {
        let cortex = test_cortex();
        cortex.register_delivery_test("k".to_owned(), "Gold, WoW EU".to_owned());
        assert_eq!(
            cortex.consume_delivery_test("k").as_deref(),
            Some("Gold, WoW EU")
        );
        assert_eq!(cortex.consume_delivery_test("k"), None);
    }

    #[test]
    fn notified_message_dedup() {
        let cortex = test_cortex();
        assert!(cortex.mark_notified(1, 10));
        assert!(!cortex.mark_notified(1, 10));
        assert!(cortex.mark_notified(1, 11));
        assert!(cortex.mark_notified(2, 10));
    }

    #[test]
    fn state_change_claim_is_once_per_tag() {
        let cortex = test_cortex();
        assert!(cortex.claim_state_change("tag1"));
        assert!(!cortex.claim_state_change("tag1"));
        assert!(cortex.claim_state_change("tag2"));
    }
}
