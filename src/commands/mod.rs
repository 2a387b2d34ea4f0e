pub mod contribute;
pub use contribute::*;
