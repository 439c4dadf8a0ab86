//! Feedback loop engine.
//!
//! A loop drives a sequence of states: the current state is shown to a set
//! of independently scheduled feedbacks, the events they emit are merged,
//! and a single pure reducer folds each event into the next state, which is
//! fed back to the feedbacks.
//!
//! Consumers describe effects as [`Feedback`]s (each with its own
//! [`ConcurrencyStrategy`] and optional [`ExecutionContext`]) and state
//! transitions as a [`Reducer`]. Independent loops talk to each other
//! through a [`Gear`].

pub mod config;
pub mod context;
pub mod driver;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod gear;
pub mod reducer;
mod relay;
pub mod stream;

pub use config::EngineConfig;
pub use context::{ContextFactory, ExecutionContext};
pub use driver::LoopBuilder;
pub use engine::Loop;
pub use error::{LoopError, Result};
pub use feedback::{ConcurrencyStrategy, Feedback};
pub use gear::Gear;
pub use reducer::Reducer;
pub use stream::{Subscription, ValueStream};
