//! Storage backends for the recorder.

pub mod postgres;

pub use postgres::PgPersister;
