pub mod bot;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod karma;
pub mod logging;
pub mod retry;
pub mod store;
pub mod transport;
