pub mod context;
pub mod middleware;
pub mod server;

pub use server::{build_router, AppState};
