pub mod error;
pub mod trace;
pub mod types;

pub use error::{Error, Result};
pub use trace::{NoopTraceSink, SpanUpdate, TraceHandle, TraceSink};
pub use types::{AccountId, SessionId};
