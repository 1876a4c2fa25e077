mod db;
mod models;
mod schema;

pub use db::StateDb;
pub use models::{FileRecord, UploadProgress};
