//! Scheduler-side control plane: queue, dispatcher, routes.

mod controller;
mod queue;
mod routes;

pub use controller::{Controller, NewSession};
pub use queue::SessionQueue;
pub use routes::{create_router, AppState, CreateSessionRequest};
