pub mod config;
pub mod datum;
pub mod error;
pub mod job;
pub mod schema;
pub mod types;
