#![doc = include_str!("../README.md")]

pub mod backend;
pub mod config;
pub mod counters;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod lock;
pub mod measure;
pub mod pixel;
pub mod query;
pub mod report;
pub mod schedule;
pub mod simulated;
