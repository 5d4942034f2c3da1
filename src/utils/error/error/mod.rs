//! Error type definitions

mod types;

pub use types::{DispatchError, Result};
