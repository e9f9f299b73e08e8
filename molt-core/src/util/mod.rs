//! Cross-thread completion gates and the cancelables registry.

mod cancelables;
mod future;

pub use cancelables::CloseableRegistry;
pub use future::{FutureGate, SignalFuture, ValueFuture};
