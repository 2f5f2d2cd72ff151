//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod http;
pub mod memory_cache;
pub mod storage;
pub mod telemetry;
