//! CLI command implementations

pub mod resolve;
pub mod serve;
pub mod stats;

pub use resolve::execute as resolve;
pub use serve::execute as serve;
pub use stats::execute as stats;
