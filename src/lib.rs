pub mod core;
pub mod error;
pub mod tools;
pub mod utils;

pub use error::{HookError, Result};

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        {
            tracing::info!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        {
            tracing::warn!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        {
            tracing::error!($($arg)*);
        }
    };
}
