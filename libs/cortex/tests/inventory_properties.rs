//! Property-based tests for the inventory engine.
//!
//! Uses proptest to verify invariants that should hold for all inputs.
//!
//! Run with: cargo test -p cortex inventory_properties --release

use cortex::inventory;
use proptest::prelude::*;

fn record_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-zA-Z0-9:_-]{1,20}", 0..40)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Drawn records plus what remains always equals the initial stock.
    #[test]
    fn draw_conserves_records(records in record_strategy(), amount in 0usize..50) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stock.txt");
        std::fs::write(&path, records.join("\n")).unwrap();

        let before = inventory::count(&path);
        match inventory::draw(&path, amount) {
            Ok((drawn, left)) => {
                prop_assert_eq!(drawn.len(), amount);
                prop_assert_eq!(left, before - amount);
                prop_assert_eq!(inventory::count(&path), left);
            }
            Err(_) => {
                // Overdraw must leave the file untouched.
                prop_assert!(amount > before);
                prop_assert_eq!(inventory::count(&path), before);
            }
        }
    }

    /// Draw followed by push-front restores the file content exactly.
    #[test]
    fn draw_then_push_front_is_identity(records in record_strategy()) {
        prop_assume!(!records.is_empty());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stock.txt");
        std::fs::write(&path, records.join("\n")).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let amount = records.len() / 2 + 1;
        let (drawn, _) = inventory::draw(&path, amount).unwrap();
        inventory::push_front(&path, &drawn).unwrap();

        prop_assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    /// Draws always hand out the head of the file in order.
    #[test]
    fn draw_is_fifo(records in record_strategy(), amount in 1usize..10) {
        prop_assume!(records.len() >= amount);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stock.txt");
        std::fs::write(&path, records.join("\n")).unwrap();

        let (drawn, _) = inventory::draw(&path, amount).unwrap();
        prop_assert_eq!(&drawn[..], &records[..amount]);
    }
}
