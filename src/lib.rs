pub mod backlog;
pub mod buffer;
pub mod client;
pub mod config;
pub mod errors;
pub mod format;
pub mod http;
pub mod lifecycle;
pub mod logs;
pub mod queue;
pub mod redact;
pub mod repo;
pub mod runner;
pub mod serve;
pub mod server;
pub mod worker;
