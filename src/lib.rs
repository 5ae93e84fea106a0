pub mod app_service;
pub mod config;
pub mod connection;
pub mod constants;
pub mod errors;
pub mod overwatch;
pub mod readiness;
pub mod retry;
pub mod services;
pub mod settings;
pub mod signal;
pub mod tunnelstate;
