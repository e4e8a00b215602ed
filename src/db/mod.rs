//! SQLite persistence layer.

mod models;
mod store;

pub use models::*;
pub use store::*;
