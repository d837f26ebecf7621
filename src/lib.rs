pub mod clock;
pub mod config;
pub mod models;
pub mod session;
pub mod store;
pub mod sync;
pub mod utils;

// Re-export main types for convenience
pub use clock::{Clock, SystemClock, TokioClock};
pub use config::SyncConfig;
pub use models::*;
pub use session::{LocalUser, Session};
pub use store::{Disposer, InMemoryStore, RemoteStore, StoreError};
pub use sync::ChatClient;
