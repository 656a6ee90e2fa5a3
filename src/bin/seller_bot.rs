use std::sync::Arc;

use anyhow::{Context, Result};
use bot_config::{AutoDeliveryConfig, AutoResponseConfig, MainConfig};
use cortex::control_plane::ControlCommand;
use cortex::{BasePaths, ControlPlane, Cortex, Supervisor};
use funpay_seller_bot::bin_common::{base_path_from_env, print_banner, print_shutdown};
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let paths = BasePaths::new(base_path_from_env());
    paths.ensure_dirs().context("failed to create data directories")?;

    let _log_guard = cortex::logging::init_tracing_with_file("info", &paths.logs_dir())
        .context("failed to initialize logging")?;

    // Single-instance guard: a second copy on the same base directory would
    // double every reply and delivery.
    let _process_lock = match cortex::supervisor::acquire_process_lock(&paths) {
        Ok(lock) => lock,
        Err(_) => {
            eprintln!("Another instance is already running on this data directory. Exiting.");
            std::process::exit(1);
        }
    };

    let main_cfg = MainConfig::load(paths.main_cfg()).context("failed to load _main.cfg")?;
    let auto_response = AutoResponseConfig::load(paths.auto_response_cfg())
        .context("failed to load auto_response.cfg")?;
    let auto_delivery = AutoDeliveryConfig::load(paths.auto_delivery_cfg())
        .context("failed to load auto_delivery.cfg")?;
    info!(
        auto_reply_rules = auto_response.len(),
        base = %paths.base().display(),
        "configuration loaded"
    );

    let (bridge, mut notifications) = ControlPlane::channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel::<ControlCommand>();

    let account = Arc::new(
        funpay_client::Account::new(
            main_cfg.funpay.golden_key.clone(),
            main_cfg.funpay.user_agent.clone(),
            None,
        )
        .context("failed to build the marketplace client")?,
    );
    let cortex = Cortex::new(
        account,
        paths,
        bridge,
        main_cfg,
        auto_response,
        auto_delivery,
    );

    // Stand-in control-plane front-end: the Telegram bot attaches to these
    // channels in production; headless runs drain notifications into the log.
    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            info!(kind = ?notification.kind, "[notification] {}", notification.text);
        }
    });
    // `command_tx` stays alive for the process lifetime; dropping it tells
    // the supervisor the front-end is gone.
    let _command_tx = command_tx;

    print_banner("FunPay seller bot");
    let mut supervisor = Supervisor::new(Arc::clone(&cortex));
    supervisor.run(command_rx).await;
    print_shutdown("FunPay seller bot", None);

    if let Err(e) = std::fs::remove_file(cortex.paths.pid_file()) {
        error!(error = %e, "failed to remove the pid file");
    }
    Ok(())
}
