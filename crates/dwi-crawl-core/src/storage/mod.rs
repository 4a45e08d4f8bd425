pub mod models;
pub mod queries;
pub mod sqlite;
pub mod tracking;

pub use sqlite::Database;
