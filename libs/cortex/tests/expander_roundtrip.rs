//! Expansion round-trip properties: templates without variables or control
//! tokens come out unchanged.

use cortex::expander::{parse_message_entities, split_text, Entity};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// A single-line body with no tokens expands to itself.
    #[test]
    fn plain_single_line_is_identity(body in "[a-zA-Z0-9 ,.!?]{1,80}") {
        prop_assume!(!body.trim().is_empty());
        let entities = parse_message_entities(&body);
        prop_assert_eq!(entities, vec![Entity::Text(body.trim().to_owned())]);
    }

    /// Splitting never produces an empty chunk and never exceeds the
    /// per-message line cap.
    #[test]
    fn chunks_are_bounded_and_non_empty(lines in prop::collection::vec("[a-z0-9 ]{0,30}", 0..60)) {
        let text = lines.join("\n");
        for chunk in split_text(&text) {
            prop_assert!(!chunk.trim().is_empty());
            prop_assert!(chunk.split('\n').count() <= 20);
        }
    }

    /// No input line is ever lost by the splitter (blank lines aside).
    #[test]
    fn split_preserves_non_blank_lines(lines in prop::collection::vec("[a-z0-9]{1,30}", 1..60)) {
        let text = lines.join("\n");
        let rejoined: Vec<String> = split_text(&text)
            .join("\n")
            .split('\n')
            .map(str::to_owned)
            .collect();
        prop_assert_eq!(rejoined, lines);
    }
}
