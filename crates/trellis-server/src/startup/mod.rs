//! Application startup: logging, listeners and shutdown

mod http;
mod logging;
mod shutdown;

pub use http::{main_server, provision_server};
pub use logging::{LogRotation, LoggingConfig, LoggingGuard, init_logging};
pub use shutdown::{GracefulShutdown, ShutdownSignal, run_with_shutdown, wait_for_shutdown_signal};
