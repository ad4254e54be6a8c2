pub mod api;
pub mod config;
pub mod dedup;
pub mod endpoints;
pub mod event;
pub mod limiters;
pub mod pipeline;
pub mod prometheus;
pub mod router;
pub mod server;
pub mod sinks;
pub mod stats;
pub mod time;
