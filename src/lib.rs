pub mod channel;
pub mod config;
pub mod counter;
pub mod engine;
pub mod gpio;
pub mod pidfile;
pub mod schedule;
pub mod upload;
