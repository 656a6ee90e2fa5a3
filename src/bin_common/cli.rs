//! CLI utilities for binaries
//!
//! Handles base-directory resolution and environment variables for the
//! binary executables.

use std::path::PathBuf;

/// Environment variable overriding the base data directory.
pub const BASE_PATH_ENV: &str = "SELLER_BOT_BASE_PATH";

/// Resolve the base data directory: the override variable when set,
/// otherwise the current working directory.
pub fn base_path_from_env() -> PathBuf {
    std::env::var(BASE_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

/// Parse command line arguments for a binary
///
/// Returns a vector of arguments (excluding the program name)
pub fn parse_args() -> Vec<String> {
    std::env::args().skip(1).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_wins_and_default_is_current_dir() {
        std::env::remove_var(BASE_PATH_ENV);
        assert_eq!(
            base_path_from_env(),
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        );
        std::env::set_var(BASE_PATH_ENV, "/tmp/seller-bot-test");
        assert_eq!(base_path_from_env(), PathBuf::from("/tmp/seller-bot-test"));
        std::env::remove_var(BASE_PATH_ENV);
    }
}
