pub mod api;
pub mod config;
pub mod discovery;
pub mod logging;
pub mod mesh;
pub mod server;
pub mod version;
