pub mod admin;
pub mod ingest;
pub mod locations;
pub mod monitors;
pub mod routes;

pub use routes::{create_router, ApiError, AppServices, AppState};
