#![doc = include_str!("../README.md")]

#[cfg(not(target_os = "linux"))]
#[path = "backend_stub.rs"]
pub mod backend;
#[cfg(target_os = "linux")]
pub mod backend;

#[cfg(target_os = "linux")]
pub mod context;
pub mod shader;
#[cfg(target_os = "linux")]
mod sys;

pub use backend::{GlBackend, GlOptions};
