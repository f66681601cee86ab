//! HTTP transport: the thin adapter between JSON requests and the manager.

pub mod routes;
pub mod server;

pub use routes::routes;
pub use server::serve;
