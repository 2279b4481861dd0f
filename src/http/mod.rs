// HTTP/SSE presentation shell over the engine handle

pub mod routes;
pub mod sse;

pub use routes::{build_router, run_http_server, HttpState};
