//! The supervising state machine: startup gating, degraded-mode recovery,
//! task wiring, the session refresher and the watchdog.
//!
//! Healthy operation runs four generation-scoped tasks (runner, dispatcher,
//! raise scheduler, session refresher) plus a global watchdog. Any of them
//! entering degraded mode wakes the supervisor, which bumps the generation
//! token (stopping the whole set) and loops back into connection recovery.

use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use funpay_client::account::ProxyConfig;
use funpay_client::error::ClientError;
use funpay_client::{Account, Runner};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::control_plane::{ControlCommand, NotificationKind};
use crate::cortex::{Cortex, DegradedReason};
use crate::dispatcher;
use crate::paths::BasePaths;
use crate::raiser;
use crate::shutdown::ShutdownManager;

/// Bounded event channel between runner and dispatcher; backpressure slows
/// the poll loop down instead of buffering without limit.
const EVENT_CHANNEL_CAPACITY: usize = 256;
const DEGRADED_EXIT_AFTER: i64 = 3 * 3600;
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);
const RUNNER_FREEZE_AFTER: i64 = 100;
const SESSION_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Held for the process lifetime; releasing the advisory lock lets the
/// next instance in.
pub struct ProcessLock {
    _file: std::fs::File,
}

/// Single-instance guard on `storage/cache/process.lock`. Failure means
/// another copy already owns this base directory.
pub fn acquire_process_lock(paths: &BasePaths) -> std::io::Result<ProcessLock> {
    std::fs::create_dir_all(paths.cache_dir())?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(paths.process_lock())?;
    file.try_lock_exclusive()?;
    std::io::Write::write_all(&mut &file, std::process::id().to_string().as_bytes())?;
    std::fs::write(paths.pid_file(), std::process::id().to_string())?;
    Ok(ProcessLock { _file: file })
}

/// Re-executes the current binary in place (watchdog recovery).
pub fn restart_process() -> ! {
    let exe = std::env::current_exe().unwrap_or_default();
    let args: Vec<String> = std::env::args().skip(1).collect();
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = std::process::Command::new(&exe).args(&args).exec();
        error!(error = %err, "exec failed during restart");
    }
    #[cfg(not(unix))]
    {
        let _ = std::process::Command::new(&exe).args(&args).spawn();
    }
    std::process::exit(1);
}

/// Builds a fresh account from the current configuration.
pub fn build_account(cortex: &Arc<Cortex>) -> Result<Arc<Account>, ClientError> {
    let cfg = cortex.main_cfg.read();
    let proxy = if cfg.proxy.is_configured() {
        Some(ProxyConfig {
            ip: cfg.proxy.ip.clone(),
            port: cfg.proxy.port.trim().parse().unwrap_or(0),
            login: (!cfg.proxy.login.is_empty()).then(|| cfg.proxy.login.clone()),
            password: (!cfg.proxy.password.is_empty()).then(|| cfg.proxy.password.clone()),
        })
    } else {
        None
    };
    let account = Account::new(
        cfg.funpay.golden_key.clone(),
        cfg.funpay.user_agent.clone(),
        proxy,
    )?;
    Ok(Arc::new(account))
}

pub struct Supervisor {
    cortex: Arc<Cortex>,
    shutdown: ShutdownManager,
    started_notified: bool,
}

impl Supervisor {
    pub fn new(cortex: Arc<Cortex>) -> Self {
        Self {
            cortex,
            shutdown: ShutdownManager::new(),
            started_notified: false,
        }
    }

    pub fn shutdown(&self) -> &ShutdownManager {
        &self.shutdown
    }

    /// Main orchestration loop; returns when the operator shuts down.
    pub async fn run(&mut self, mut commands: mpsc::UnboundedReceiver<ControlCommand>) {
        // Ctrl+C stops the generation-scoped tasks immediately; the main
        // loop then observes the flag and unwinds.
        let cortex = Arc::clone(&self.cortex);
        self.shutdown.spawn_signal_handler(move || {
            cortex.state.bump_generation();
            cortex.state.wake.notify_waiters();
        });
        self.spawn_watchdog();

        while self.shutdown.is_running() {
            if !self.wait_for_connection().await {
                return;
            }

            let generation = self.cortex.state.bump_generation();
            if !self.start_healthy_tasks(generation).await {
                continue;
            }

            // Healthy: drain control commands until something degrades.
            loop {
                tokio::select! {
                    _ = self.cortex.state.wake.notified() => {
                        if self.cortex.state.is_degraded() {
                            break;
                        }
                    }
                    command = commands.recv() => {
                        match command {
                            Some(command) => self.handle_command(command).await,
                            None => {
                                // Front-end gone: treat as an operator shutdown.
                                self.shutdown.trigger();
                                break;
                            }
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {
                        if !self.shutdown.is_running() {
                            break;
                        }
                        if self.cortex.state.is_degraded() {
                            break;
                        }
                    }
                }
            }

            // Stop the generation-scoped tasks before recovering.
            self.cortex.state.bump_generation();
            if !self.shutdown.is_running() {
                break;
            }
        }
        self.cortex.pool.close();
        info!("supervisor stopped");
    }

    /// Startup gating: proxy present -> proxy reachable -> credentials
    /// valid -> logged in. Returns false when the process should exit.
    async fn wait_for_connection(&mut self) -> bool {
        loop {
            if !self.shutdown.is_running() {
                return false;
            }
            if let Some(since) = self.cortex.state.degraded_since() {
                if chrono::Utc::now().timestamp() - since > DEGRADED_EXIT_AFTER {
                    error!("three hours in degraded mode, shutting down");
                    self.cortex.bridge.notify(
                        NotificationKind::Critical,
                        "The bot spent three hours in degraded mode and is shutting down. \
                         Fix the configuration and start it again.",
                    );
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    std::process::exit(0);
                }
            }

            let proxy_configured = self.cortex.main_cfg.read().proxy.is_configured();
            if !proxy_configured {
                self.cortex.enter_degraded(
                    DegradedReason::ProxyMissing,
                    "No proxy is configured. Operation is paused until a proxy \
                     (ip:port or login:pass@ip:port) is supplied.",
                );
                if !self.shutdown.backoff(Duration::from_secs(5)).await {
                    return false;
                }
                continue;
            }

            // Pick up token/proxy edits made while degraded.
            match build_account(&self.cortex) {
                Ok(account) => self.cortex.replace_account(account),
                Err(e) => {
                    error!(error = %e, "failed to build the client from the configuration");
                    if !self.shutdown.backoff(Duration::from_secs(30)).await {
                        return false;
                    }
                    continue;
                }
            }
            let account = self.cortex.account();

            if !account.has_token() {
                self.cortex.enter_degraded(
                    DegradedReason::Credentials,
                    "The session token is missing. Supply a new golden key to log in.",
                );
                if !self.shutdown.backoff(Duration::from_secs(30)).await {
                    return false;
                }
                continue;
            }

            if !account.check_proxy().await {
                self.cortex.enter_degraded(
                    DegradedReason::ProxyDead,
                    "The configured proxy is unreachable. Operation is paused; \
                     supply a working proxy to resume.",
                );
                if !self.shutdown.backoff(Duration::from_secs(30)).await {
                    return false;
                }
                continue;
            }

            match account.get(true).await {
                Ok(()) => {
                    info!(
                        user_id = account.id(),
                        username = %account.username(),
                        "logged in"
                    );
                    self.cortex.mark_healthy();
                    return true;
                }
                Err(ClientError::Unauthorized) => {
                    self.cortex.enter_degraded(
                        DegradedReason::Credentials,
                        "The marketplace rejected the session token (401/403). \
                         Supply a new golden key.",
                    );
                }
                Err(e) if e.is_connection_dropped() => {
                    self.cortex.enter_degraded(
                        DegradedReason::ProxyBlocked,
                        "The proxy passes its reachability check but the marketplace \
                         drops the connection (EOF). The address is likely blocked; \
                         switch to a different proxy.",
                    );
                }
                Err(ClientError::Network(e)) => {
                    self.cortex.enter_degraded(
                        DegradedReason::Network,
                        &format!("Cannot reach the marketplace through the proxy: {e}"),
                    );
                }
                Err(e) => {
                    self.cortex.enter_degraded(
                        DegradedReason::Upstream,
                        &format!("The marketplace returned an error during login: {e}"),
                    );
                }
            }
            info!("retrying connection in 30 seconds");
            if !self.shutdown.backoff(Duration::from_secs(30)).await {
                return false;
            }
        }
    }

    /// Spawns the generation-scoped task set. False when prerequisites
    /// (profile) cannot be fetched, which re-enters recovery.
    async fn start_healthy_tasks(&mut self, generation: u64) -> bool {
        if !self.cortex.refresh_profile(5, true).await {
            self.cortex.enter_degraded(
                DegradedReason::Upstream,
                "Logged in, but the profile could not be fetched.",
            );
            return false;
        }
        if let Some(balance) = self.cortex.fetch_balance().await {
            info!(
                rub = balance.total_rub,
                usd = balance.total_usd,
                eur = balance.total_eur,
                "balance fetched"
            );
        }
        if !self.started_notified {
            self.started_notified = true;
            let account = self.cortex.account();
            self.cortex.bridge.notify(
                NotificationKind::BotStart,
                format!(
                    "Bot started for {} (id {}), {} active sales.",
                    account.username(),
                    account.id(),
                    account.active_sales()
                ),
            );
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (requests_delay, old_mode) = {
            let cfg = self.cortex.main_cfg.read();
            (cfg.other.requests_delay, cfg.funpay.old_msg_get_mode)
        };

        // Legacy mode drives handlers off chat-list snapshots alone; no
        // history fetching in that case.
        let runner = Runner::new(self.cortex.account(), !old_mode, false);
        self.cortex.set_runner_handle(runner.handle());
        let generation_token = self.cortex.state.generation_handle();
        let cortex = Arc::clone(&self.cortex);
        tokio::spawn(async move {
            match runner.listen(tx, requests_delay, generation_token, generation).await {
                Ok(()) => {}
                Err(ClientError::Unauthorized) => {
                    cortex.enter_degraded(
                        DegradedReason::Credentials,
                        "The marketplace rejected the session token (401/403). \
                         Supply a new golden key.",
                    );
                }
                Err(e) if e.is_connection_dropped() => {
                    cortex.enter_degraded(
                        DegradedReason::ProxyBlocked,
                        "The marketplace keeps dropping the connection (EOF); the \
                         proxy address is likely blocked.",
                    );
                }
                Err(e) => {
                    cortex.enter_degraded(
                        DegradedReason::Network,
                        &format!("The update loop failed repeatedly: {e}"),
                    );
                }
            }
        });

        tokio::spawn(dispatcher::run_dispatcher(
            Arc::clone(&self.cortex),
            rx,
            generation,
        ));
        tokio::spawn(raiser::raise_loop(Arc::clone(&self.cortex), generation));
        self.spawn_session_refresh(generation);
        self.spawn_proxy_check(generation);
        true
    }

    fn spawn_session_refresh(&self, my_generation: u64) {
        let cortex = Arc::clone(&self.cortex);
        tokio::spawn(async move {
            info!("session refresh loop started");
            loop {
                tokio::time::sleep(SESSION_REFRESH_INTERVAL).await;
                if cortex.state.generation() != my_generation {
                    return;
                }
                if !cortex.state.is_healthy() {
                    continue;
                }
                if !cortex.update_session().await {
                    // Repeated refresh failures mean the token is gone.
                    if let Err(ClientError::Unauthorized) = cortex.account().get(true).await {
                        cortex.enter_degraded(
                            DegradedReason::Credentials,
                            "Session refresh was rejected (401/403); a new golden \
                             key is required.",
                        );
                    }
                }
            }
        });
    }

    fn spawn_proxy_check(&self, my_generation: u64) {
        let (check, interval) = {
            let cfg = self.cortex.main_cfg.read();
            (cfg.proxy.check, cfg.proxy.check_interval.max(60))
        };
        if !check {
            return;
        }
        let cortex = Arc::clone(&self.cortex);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;
                if cortex.state.generation() != my_generation {
                    return;
                }
                if cortex.state.is_healthy() && !cortex.account().check_proxy().await {
                    cortex.enter_degraded(
                        DegradedReason::ProxyDead,
                        "The proxy stopped responding; operation is paused until \
                         it recovers or is replaced.",
                    );
                    return;
                }
            }
        });
    }

    /// Watchdog: restarts the process when the runner stops advancing its
    /// heartbeat while the system believes itself healthy.
    fn spawn_watchdog(&self) {
        let cortex = Arc::clone(&self.cortex);
        tokio::spawn(async move {
            info!("watchdog started");
            loop {
                tokio::time::sleep(WATCHDOG_INTERVAL).await;
                if !cortex.state.is_healthy() {
                    continue;
                }
                let Some(handle) = cortex.runner_handle() else {
                    continue;
                };
                let last = handle.last_activity();
                if last == 0 {
                    continue;
                }
                let silence = chrono::Utc::now().timestamp() - last;
                if silence > RUNNER_FREEZE_AFTER {
                    error!(silence, "watchdog: runner freeze detected, restarting");
                    cortex.bridge.notify(
                        NotificationKind::Critical,
                        "Watchdog: the update loop froze; restarting the process.",
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    restart_process();
                }
            }
        });
    }

    /// Imperative operations arriving from the control-plane front-end.
    async fn handle_command(&self, command: ControlCommand) {
        match command {
            ControlCommand::SendMessage { chat_id, text } => {
                let cortex = Arc::clone(&self.cortex);
                let pool = cortex.pool.clone();
                pool.spawn("operator_send", async move {
                    cortex.send_message(chat_id, &text, None, None, true).await;
                });
            }
            ControlCommand::RefundOrder { order_id } => {
                let cortex = Arc::clone(&self.cortex);
                let pool = cortex.pool.clone();
                pool.spawn("operator_refund", async move {
                    for attempt in 1..=3u32 {
                        match cortex.account().refund(&order_id).await {
                            Ok(()) => {
                                info!(order_id = %order_id, "order refunded");
                                cortex.bridge.notify(
                                    NotificationKind::Order,
                                    format!("Order #{order_id} refunded."),
                                );
                                return;
                            }
                            Err(e) => {
                                warn!(order_id = %order_id, attempt, error = %e, "refund failed");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                    cortex.bridge.notify(
                        NotificationKind::Critical,
                        format!("Failed to refund order #{order_id} after 3 attempts."),
                    );
                });
            }
            ControlCommand::RefreshProfile => {
                let cortex = Arc::clone(&self.cortex);
                let pool = cortex.pool.clone();
                pool.spawn("operator_profile_refresh", async move {
                    cortex.refresh_profile(3, true).await;
                });
            }
            ControlCommand::ToggleAutoRaise => {
                self.toggle(|cfg| {
                    cfg.funpay.auto_raise = !cfg.funpay.auto_raise;
                    cfg.funpay.auto_raise
                });
            }
            ControlCommand::ToggleAutoResponse => {
                self.toggle(|cfg| {
                    cfg.funpay.auto_response = !cfg.funpay.auto_response;
                    cfg.funpay.auto_response
                });
            }
            ControlCommand::ToggleAutoDelivery => {
                self.toggle(|cfg| {
                    cfg.funpay.auto_delivery = !cfg.funpay.auto_delivery;
                    cfg.funpay.auto_delivery
                });
            }
            ControlCommand::SubmitDeliveryTest { key, lot_title } => {
                self.cortex.register_delivery_test(key, lot_title);
            }
        }
    }

    fn toggle(&self, mutate: impl FnOnce(&mut bot_config::MainConfig) -> bool) {
        let snapshot = {
            let mut cfg = self.cortex.main_cfg.write();
            mutate(&mut cfg);
            cfg.clone()
        };
        if let Err(e) = snapshot.save(self.cortex.paths.main_cfg()) {
            error!(error = %e, "failed to persist the main config");
        }
    }
}
