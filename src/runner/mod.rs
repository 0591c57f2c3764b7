//! The runner: drives a [`crate::model::Request`] through however many
//! provider turns it takes, in either buffered or streaming mode.

pub mod accumulator;
pub mod buffered;
pub mod finalizer;
pub mod ids;
pub mod stop;
pub mod streaming;

pub use buffered::run_buffered;
pub use streaming::run_streaming;
