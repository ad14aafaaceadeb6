pub mod config;
pub mod configuration;
pub mod errors;
pub mod program;
pub mod tunable;

pub use config::*;
pub use configuration::*;
pub use errors::*;
pub use program::*;
pub use tunable::*;
