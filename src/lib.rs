pub mod config;
pub mod db;
pub mod error;
pub mod handler;
pub mod lock_monitor;
pub mod model;
pub mod oms;
pub mod pipeline;
pub mod rename;
pub mod session;
