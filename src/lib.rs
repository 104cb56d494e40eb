pub mod config;
pub mod dispatch;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod service;
pub mod wal;
