pub mod config;
pub mod keys;
pub mod metadata;
pub mod registry;
pub mod router;
pub mod rpc;
pub mod server;
pub mod service;
pub mod shutdown;
pub mod telemetry;
pub mod types;
pub mod upstream;
