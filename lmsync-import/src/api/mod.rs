//! HTTP API handlers for lmsync-import

pub mod events;
pub mod health;
pub mod runs;

pub use events::event_stream;
pub use health::health_routes;
pub use runs::run_routes;
