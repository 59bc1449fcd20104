pub mod blocks;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod reactions;
pub mod sessions;
pub mod users;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
