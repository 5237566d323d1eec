pub mod breaker;
pub mod retry;

pub use breaker::{Admission, BreakerRegistry};
pub use retry::Retrier;
