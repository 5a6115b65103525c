mod error;
mod pool;
mod server;

pub mod annotate;
pub mod command;
pub mod config;
pub mod detector;

pub use error::{ExchangeError, ServerError};
pub use pool::DetectionPool;
pub use server::{build_detector, run_server, start_server, ServerPortal, ServerPortalConfig};
