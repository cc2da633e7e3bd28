pub mod billing;
pub mod config;
pub mod error;
pub mod extractor;
pub mod routes;

pub use routes::{api_routes, app};
