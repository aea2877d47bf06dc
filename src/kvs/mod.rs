//! Concurrent key-value structures backing the agent.

mod bidimap;
mod cow;

pub use bidimap::BidiMap;
pub use cow::CowMap;
