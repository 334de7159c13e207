pub mod error;
pub mod routes;
pub mod state;

pub use error::*;
pub use routes::*;
pub use state::*;
