//! FunPay seller bot - main library
//!
//! Re-exports the workspace crates and the shared binary plumbing.
//!
//! ## Architecture
//!
//! - **bin_common**: Common utilities for binary executables (CLI, runners)
//! - **cortex**: Event pipeline, handlers, schedulers, supervisor
//! - **funpay-client**: Typed client + long-poll runner for the marketplace
//! - **bot-config**: Operator configuration and setting stores

// Re-export workspace libraries for convenience
pub use bot_config;
pub use cortex;
pub use funpay_client;

// Binary common utilities
pub mod bin_common {
    //! Common utilities for binary executables

    pub mod cli;
    pub mod runner;

    pub use cli::{base_path_from_env, BASE_PATH_ENV};
    pub use runner::{print_banner, print_shutdown};
}
