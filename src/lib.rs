pub mod db;
pub mod events;
pub mod monitoring;
pub mod notifications;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod sweeps;
pub mod version;
pub mod web;
