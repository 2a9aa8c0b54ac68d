pub mod config;
pub mod error;
pub mod snapshot;

pub use config::TallyConfig;
pub use error::TallyError;
pub use snapshot::{HeaderMultimap, LogEntry, RequestSnapshot, ResponseSnapshot};
