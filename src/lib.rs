//! Edge traffic control: a reverse proxy that balances a backend cluster
//! and protects it from abusive clients.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
