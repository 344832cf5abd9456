pub mod connection;
pub mod migrate;
pub mod records;

pub use records::SqliteRecordStore;
