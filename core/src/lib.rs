pub mod channel;
pub mod config;
pub mod error;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use config::Config;
pub use error::{GridfillError, Result};
pub use registry::SessionRegistry;
pub use session::Session;
pub use store::PuzzleStore;
