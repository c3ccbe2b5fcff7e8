pub mod client;
pub mod error;
pub mod metrics;
pub mod queue;
#[cfg(feature = "test-util")]
pub mod test_util;
pub mod types;
mod url;
