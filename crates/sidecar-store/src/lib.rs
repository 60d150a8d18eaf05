pub mod database;
pub mod error;
pub mod results;
pub mod schema;
pub mod view;

pub use database::Database;
pub use error::StoreError;
pub use results::ResultRepo;
pub use view::{RestoreOutcome, ResultView};
