//! Error handling: the dispatcher's error taxonomy and retry recovery.

pub mod error;
pub mod recovery;

pub use error::{DispatchError, Result};
pub use recovery::{RetryConfig, RetryPolicy};
