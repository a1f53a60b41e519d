//! Data models for flowscope
//!
//! These models are shared by the store, the live event bus and the HTTP surface.

pub mod flow;
pub mod replay;
pub mod scope;

pub use flow::*;
pub use replay::*;
pub use scope::*;
