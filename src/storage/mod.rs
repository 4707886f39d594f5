pub mod database;

pub use database::{SignatureRecord, Storage};
