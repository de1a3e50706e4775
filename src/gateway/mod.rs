pub mod auth;
pub mod server;

pub use server::{router, GatewayState};
