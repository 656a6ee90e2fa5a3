//! Integration test: configuration loading through the re-exported crates.

use funpay_seller_bot::bot_config::{AutoDeliveryConfig, AutoResponseConfig, MainConfig};
use funpay_seller_bot::cortex::BasePaths;

#[test]
fn fresh_base_dir_bootstraps_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let paths = BasePaths::new(dir.path());
    paths.ensure_dirs().unwrap();

    let main = MainConfig::load(paths.main_cfg()).unwrap();
    assert!(paths.main_cfg().exists());
    assert_eq!(main.funpay.locale, "ru");
    assert_eq!(main.other.watermark, "");
    assert!(!main.funpay.auto_delivery);

    // Rule files are optional on a fresh install.
    let responses = AutoResponseConfig::load(paths.auto_response_cfg()).unwrap();
    assert!(responses.is_empty());
    let delivery = AutoDeliveryConfig::load(paths.auto_delivery_cfg()).unwrap();
    assert!(delivery.get("anything").is_none());
}

#[test]
fn layout_places_state_under_storage() {
    let paths = BasePaths::new("/data");
    assert_eq!(
        paths.process_lock(),
        std::path::Path::new("/data/storage/cache/process.lock")
    );
    assert_eq!(
        paths.product_file("wow.txt"),
        std::path::Path::new("/data/storage/products/wow.txt")
    );
    assert_eq!(
        paths.main_cfg(),
        std::path::Path::new("/data/configs/_main.cfg")
    );
}
