//! Typed error hierarchy for counter acquisition.
//!
//! Uses `thiserror` for library-grade errors. Every variant is fatal except
//! [`ProbeError::CounterUnitBusy`] before the retry budget runs out, which
//! never escapes the lock controller.
//!
//! # Error codes
//!
//! Each variant maps to a stable integer code via [`ProbeError::error_code`]
//! and to a taxonomy bucket via [`ProbeError::category`].

use std::fmt;

use crate::counters::{CounterClass, CounterDataType};

/// Taxonomy bucket of a [`ProbeError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Contention,
    Submission,
    Synchronization,
    ResultIntegrity,
    Protocol,
    Environment,
    Output,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuration => "configuration",
            Self::Contention => "contention",
            Self::Submission => "submission",
            Self::Synchronization => "synchronization",
            Self::ResultIntegrity => "result-integrity",
            Self::Protocol => "protocol",
            Self::Environment => "environment",
            Self::Output => "output",
        };
        f.write_str(name)
    }
}

/// All errors originating from counter acquisition and its backends.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    // ── Configuration ────────────────────────────────────────────────
    #[error(
        "counter '{counter}' not found in query '{query}'; disable performance queries with PERF_ENABLED=0"
    )]
    CounterNotFound { query: String, counter: String },

    #[error("counter '{counter}' is reported {count} times by query '{query}'")]
    DuplicateCounter {
        query: String,
        counter: String,
        count: usize,
    },

    #[error("counter '{counter}' data type mismatch: expected {expected:?}, driver reports {actual:?}")]
    CounterTypeMismatch {
        counter: String,
        expected: CounterDataType,
        actual: CounterDataType,
    },

    #[error("counter '{counter}' class mismatch: expected {expected:?}, driver reports {actual:?}")]
    CounterClassMismatch {
        counter: String,
        expected: CounterClass,
        actual: Option<CounterClass>,
    },

    #[error("counter '{counter}' size mismatch: {data_type:?} needs {expected} bytes, driver reports {actual}")]
    CounterSizeMismatch {
        counter: String,
        data_type: CounterDataType,
        expected: usize,
        actual: usize,
    },

    #[error(
        "counter '{counter}' at offset {offset} (+{size} bytes) lies outside the {result_size}-byte result"
    )]
    CounterOutOfRange {
        counter: String,
        offset: usize,
        size: usize,
        result_size: usize,
    },

    #[error("performance query '{0}' not found; disable performance queries with PERF_ENABLED=0")]
    QueryNotFound(String),

    #[error("required extension {0} is not supported by the driver")]
    MissingExtension(String),

    #[error("invalid dispatch dimensions: {0}")]
    InvalidDimensions(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Contention ───────────────────────────────────────────────────
    #[error("counter unit still busy after {attempts} begin attempts")]
    CounterUnitBusy { attempts: u32 },

    #[error("profiling lock error: {0}")]
    ProfilingLock(String),

    // ── Submission ───────────────────────────────────────────────────
    #[error("submission rejected: {0}")]
    Submission(String),

    // ── Synchronization ──────────────────────────────────────────────
    #[error("fence not signalled within {timeout_ms} ms")]
    FenceTimeout { timeout_ms: u64 },

    #[error("synchronization failed: {0}")]
    Synchronization(String),

    // ── Result integrity ─────────────────────────────────────────────
    #[error("query '{query}' returned {actual} bytes, expected {expected}")]
    ResultSizeMismatch {
        query: String,
        expected: usize,
        actual: usize,
    },

    #[error("read of {size} bytes at offset {offset} exceeds {len}-byte result buffer")]
    ResultOutOfBounds {
        offset: usize,
        size: usize,
        len: usize,
    },

    // ── Protocol ─────────────────────────────────────────────────────
    #[error("query session: cannot {op} while {state}")]
    QueryState {
        op: &'static str,
        state: &'static str,
    },

    // ── Environment ──────────────────────────────────────────────────
    #[error("loader error: {0}")]
    Loader(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("driver call {call} failed: {detail}")]
    Driver { call: &'static str, detail: String },

    #[error("shader error: {0}")]
    Shader(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ── Output ───────────────────────────────────────────────────────
    #[error("failed to serialise output: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ProbeError {
    /// Stable integer error code for structured logs.
    ///
    /// - 1xx: configuration
    /// - 2xx: contention
    /// - 3xx: submission
    /// - 4xx: synchronization
    /// - 5xx: result integrity
    /// - 6xx: protocol misuse
    /// - 7xx: environment
    /// - 8xx: output
    pub fn error_code(&self) -> u32 {
        match self {
            Self::CounterNotFound { .. } => 100,
            Self::DuplicateCounter { .. } => 101,
            Self::CounterTypeMismatch { .. } => 102,
            Self::CounterClassMismatch { .. } => 103,
            Self::CounterSizeMismatch { .. } => 104,
            Self::CounterOutOfRange { .. } => 105,
            Self::QueryNotFound(_) => 106,
            Self::MissingExtension(_) => 107,
            Self::InvalidDimensions(_) => 108,
            Self::InvalidConfig(_) => 109,
            Self::CounterUnitBusy { .. } => 200,
            Self::ProfilingLock(_) => 201,
            Self::Submission(_) => 300,
            Self::FenceTimeout { .. } => 400,
            Self::Synchronization(_) => 401,
            Self::ResultSizeMismatch { .. } => 500,
            Self::ResultOutOfBounds { .. } => 501,
            Self::QueryState { .. } => 600,
            Self::Loader(_) => 700,
            Self::Device(_) => 701,
            Self::Driver { .. } => 702,
            Self::Shader(_) => 703,
            Self::Io(_) => 704,
            Self::Serialize(_) => 800,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self.error_code() / 100 {
            1 => ErrorCategory::Configuration,
            2 => ErrorCategory::Contention,
            3 => ErrorCategory::Submission,
            4 => ErrorCategory::Synchronization,
            5 => ErrorCategory::ResultIntegrity,
            6 => ErrorCategory::Protocol,
            8 => ErrorCategory::Output,
            _ => ErrorCategory::Environment,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ProbeError>;
