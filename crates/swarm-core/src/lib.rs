pub mod config;
pub mod events;
pub mod progress;
pub mod state;
pub mod types;

pub use config::*;
pub use events::*;
pub use progress::*;
pub use state::*;
pub use types::*;
