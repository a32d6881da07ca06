pub mod cache;
pub mod config;
pub mod presets;
pub mod tasks;

pub use cache::*;
pub use config::*;
pub use presets::*;
pub use tasks::*;
