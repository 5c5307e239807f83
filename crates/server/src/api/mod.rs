pub mod handlers;
pub mod jobs;
pub mod middleware;
pub mod orchestrator;
pub mod routes;
pub mod workers;

pub use routes::create_router;
