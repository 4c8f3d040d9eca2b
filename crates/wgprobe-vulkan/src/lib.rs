#![doc = include_str!("../README.md")]

pub mod backend;
pub mod context;
pub mod lock;
pub mod pipeline;

pub use backend::VulkanBackend;
pub use context::VulkanContext;
pub use lock::VulkanProfilingLock;
pub use pipeline::{ComputePipeline, SpecializationConstants};
