pub mod auth;
pub mod config;
pub mod database;
pub mod models;
pub mod seed;
pub mod server;
pub mod simulator;
pub mod uploads;

pub use config::ServerConfig;
pub use database::Database;
pub use models::*;
pub use simulator::TelemetrySimulator;
