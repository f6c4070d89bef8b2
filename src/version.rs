//! Version information module
//!
//! Build metadata is injected by `build.rs`.

use serde::Serialize;

macro_rules! build_env {
    ($name:ident) => {
        env!(concat!("GOSSIPKV_", stringify!($name)))
    };
}

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const BUILD_HASH: &str = build_env!(BUILD_HASH);
pub const BUILD_DATE: &str = build_env!(BUILD_DATE);

/// Body of `GET /version`.
#[derive(Debug, Clone, Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
    pub build_hash: &'static str,
    pub build_date: &'static str,
}

impl VersionResponse {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            build_hash: BUILD_HASH,
            build_date: BUILD_DATE,
        }
    }
}

/// `gossipkv 0.3.0 (abc1234, 2024-01-01T00:00:00Z)`
pub fn get_version_string() -> String {
    format!("gossipkv {VERSION} ({BUILD_HASH}, {BUILD_DATE})")
}
