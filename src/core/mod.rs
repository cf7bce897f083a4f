//! Core engine types and utilities

pub mod config;
pub mod error;
pub mod logging;

pub use config::{DeviceClass, EngineConfig, PAGE_SIZE};
pub use error::{Error, Result};
