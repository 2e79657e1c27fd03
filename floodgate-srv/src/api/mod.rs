//! HTTP API handlers for floodgate-srv

pub mod admission;
pub mod error;
pub mod events;
pub mod health;
pub mod sink;

pub use admission::admission_middleware;
pub use error::ApiError;
pub use events::{publish, remove_stream, subscribe};
pub use health::health_routes;
