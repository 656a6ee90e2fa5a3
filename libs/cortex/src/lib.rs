//! The coordinator: event dispatch, handler chains, schedulers and the
//! supervising state machine around the marketplace client.

pub mod control_plane;
pub mod cortex;
pub mod dispatcher;
pub mod expander;
pub mod handlers;
pub mod inventory;
pub mod logging;
pub mod paths;
pub mod pool;
pub mod raiser;
pub mod shutdown;
pub mod supervisor;

pub use control_plane::{ControlCommand, ControlPlane, Notification, NotificationKind};
pub use cortex::Cortex;
pub use logging::{init_tracing, init_tracing_with_level};
pub use paths::BasePaths;
pub use pool::WorkerPool;
pub use shutdown::ShutdownManager;
pub use supervisor::Supervisor;
