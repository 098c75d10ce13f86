pub mod config;
pub mod core_services;
pub mod logging;
