//! Utility modules for lmsync-import

pub mod retry;

pub use retry::{retry_transient, RetryPolicy, Retryable};
