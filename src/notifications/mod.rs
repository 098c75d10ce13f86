pub mod models;
pub mod senders;
pub mod service;

pub use service::NotificationDispatcher;
