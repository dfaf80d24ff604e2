//! Long-running digest daemon: weekly cron trigger, Unix-socket control
//! server and log rotation around a single [`digest_sync::WeeklySyncOrchestrator`].

mod error;
pub mod log_rotation;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_episodes, request_history, request_run, request_status, request_stop, send_request,
    DaemonRequest, DaemonResponse,
};
pub use runtime::{init_tracing, run, start_blocking, Daemon};
