pub mod app;
pub mod bootstrap;
pub mod cancel;
pub mod clients;
pub mod config;
pub mod error;
pub mod rate_limiter;
pub mod repositories;
pub mod scheduler;
pub mod services;
pub mod telemetry;
