pub mod database;
pub mod drafts;
pub mod error;
pub mod findings;
pub mod projects;
pub mod reports;
pub mod row_helpers;
pub mod runs;
pub mod schema;
pub mod steps;
pub mod templates;

pub use database::Database;
pub use error::StoreError;
