//! Counter catalog resolution.
//!
//! Backends enumerate what the driver exposes into a [`Catalog`]; [`resolve`]
//! picks the required counters out of it, checks that the driver still
//! describes them the way we expect, and records where each value will sit
//! in the raw query result.
//!
//! Both locator flavours normalize to a byte offset:
//!
//! - legacy (INTEL perf query): the driver reports a byte offset into one
//!   flat result blob whose total size comes from the query info.
//! - modern (`VK_KHR_performance_query`): the driver reports an index into
//!   its counter enumeration; the query pool is created over our selected
//!   subset and returns one 8-byte result slot per selected counter, in
//!   selection order.

use tracing::debug;

use crate::error::{ProbeError, Result};

/// Size of one modern-backend result slot (`VkPerformanceCounterResultKHR`).
pub const RESULT_SLOT_SIZE: usize = 8;

/// Counter names as the drivers spell them.
pub mod names {
    pub const EU_THREAD_OCCUPANCY: &str = "EU Thread Occupancy";
    pub const CS_THREADS_DISPATCHED: &str = "CS Threads Dispatched";
    pub const GPU_TIME_ELAPSED: &str = "GPU Time Elapsed";
    /// INTEL "Pipeline Statistics Registers" query.
    pub const N_CS_INVOCATIONS: &str = "N compute shader invocations";
    /// Synthesized entry for a Vulkan pipeline-statistics pool.
    pub const CS_INVOCATIONS: &str = "compute shader invocations";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterDataType {
    UInt32,
    UInt64,
    Int32,
    Int64,
    Float32,
    Float64,
    Bool32,
    /// A driver enum we have no decoding for, kept so resolution can name it.
    Unknown(u32),
}

impl CounterDataType {
    pub fn size(self) -> usize {
        match self {
            Self::UInt32 | Self::Int32 | Self::Float32 | Self::Bool32 => 4,
            Self::UInt64 | Self::Int64 | Self::Float64 => 8,
            Self::Unknown(_) => 0,
        }
    }
}

/// How the driver accumulates a counter. Only the legacy backend reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterClass {
    Event,
    DurationNorm,
    DurationRaw,
    Throughput,
    Raw,
    Timestamp,
}

/// What a resolved counter feeds into the report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CounterRole {
    Occupancy,
    ThreadsDispatched,
    GpuTime,
    ShaderInvocations,
}

/// Where the driver says a counter lives, before normalization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatalogLocator {
    /// Byte offset into the query's flat result.
    Offset(usize),
    /// Index into the driver's counter enumeration.
    Index(u32),
}

/// One counter as enumerated from the driver.
#[derive(Clone, Debug, PartialEq)]
pub struct CatalogEntry {
    pub name: String,
    pub data_type: CounterDataType,
    pub class: Option<CounterClass>,
    /// Byte size the driver reports, when it reports one.
    pub data_size: Option<usize>,
    pub locator: CatalogLocator,
}

/// Everything one query kind exposes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Catalog {
    /// Driver-side query name, carried into diagnostics.
    pub query: String,
    pub entries: Vec<CatalogEntry>,
    /// Total result size when the driver declares one (legacy).
    pub result_size: Option<usize>,
}

/// Resolved position of a counter inside the raw result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Locator {
    Offset(usize),
    Index { slot: usize, catalog_index: u32 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct CounterDescriptor {
    pub name: String,
    pub role: CounterRole,
    pub data_type: CounterDataType,
    pub class: Option<CounterClass>,
    pub locator: Locator,
}

impl CounterDescriptor {
    /// Byte offset of this counter's value in the raw result.
    pub fn byte_offset(&self) -> usize {
        match self.locator {
            Locator::Offset(offset) => offset,
            Locator::Index { slot, .. } => slot * RESULT_SLOT_SIZE,
        }
    }
}

/// Hardcoded contract a driver counter must satisfy.
#[derive(Clone, Copy, Debug)]
pub struct CounterExpectation {
    pub name: &'static str,
    pub role: CounterRole,
    pub data_type: CounterDataType,
    /// `None` for backends that do not classify counters.
    pub class: Option<CounterClass>,
}

/// "Compute Metrics Basic Gen9" on the legacy backend.
pub const LEGACY_METRICS: &[CounterExpectation] = &[
    CounterExpectation {
        name: names::EU_THREAD_OCCUPANCY,
        role: CounterRole::Occupancy,
        data_type: CounterDataType::Float32,
        class: Some(CounterClass::Raw),
    },
    CounterExpectation {
        name: names::CS_THREADS_DISPATCHED,
        role: CounterRole::ThreadsDispatched,
        data_type: CounterDataType::UInt64,
        class: Some(CounterClass::Event),
    },
    CounterExpectation {
        name: names::GPU_TIME_ELAPSED,
        role: CounterRole::GpuTime,
        data_type: CounterDataType::UInt64,
        class: Some(CounterClass::Raw),
    },
];

/// "Pipeline Statistics Registers" on the legacy backend.
pub const LEGACY_PIPELINE_STATISTICS: &[CounterExpectation] = &[CounterExpectation {
    name: names::N_CS_INVOCATIONS,
    role: CounterRole::ShaderInvocations,
    data_type: CounterDataType::UInt64,
    class: Some(CounterClass::Raw),
}];

pub const MODERN_METRICS: &[CounterExpectation] = &[
    CounterExpectation {
        name: names::EU_THREAD_OCCUPANCY,
        role: CounterRole::Occupancy,
        data_type: CounterDataType::Float32,
        class: None,
    },
    CounterExpectation {
        name: names::CS_THREADS_DISPATCHED,
        role: CounterRole::ThreadsDispatched,
        data_type: CounterDataType::UInt64,
        class: None,
    },
    CounterExpectation {
        name: names::GPU_TIME_ELAPSED,
        role: CounterRole::GpuTime,
        data_type: CounterDataType::UInt64,
        class: None,
    },
];

pub const MODERN_PIPELINE_STATISTICS: &[CounterExpectation] = &[CounterExpectation {
    name: names::CS_INVOCATIONS,
    role: CounterRole::ShaderInvocations,
    data_type: CounterDataType::UInt64,
    class: None,
}];

/// Ordered selection of counters out of one catalog.
#[derive(Clone, Debug, PartialEq)]
pub struct CounterSet {
    query: String,
    counters: Vec<CounterDescriptor>,
    result_size: usize,
}

impl CounterSet {
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CounterDescriptor> {
        self.counters.iter()
    }

    pub fn get(&self, name: &str) -> Option<&CounterDescriptor> {
        self.counters.iter().find(|c| c.name == name)
    }

    pub fn by_role(&self, role: CounterRole) -> Option<&CounterDescriptor> {
        self.counters.iter().find(|c| c.role == role)
    }

    /// Exact number of bytes a read of this set must return.
    pub fn result_size(&self) -> usize {
        self.result_size
    }

    /// Driver enumeration indices in slot order, for building the modern
    /// query pool. Empty for offset-located sets.
    pub fn selected_indices(&self) -> Vec<u32> {
        let mut indexed: Vec<(usize, u32)> = self
            .counters
            .iter()
            .filter_map(|c| match c.locator {
                Locator::Index {
                    slot,
                    catalog_index,
                } => Some((slot, catalog_index)),
                Locator::Offset(_) => None,
            })
            .collect();
        indexed.sort_unstable_by_key(|(slot, _)| *slot);
        indexed.into_iter().map(|(_, index)| index).collect()
    }
}

/// Select `required` out of `catalog`.
///
/// Every required name must appear exactly once with the expected data type
/// and class; any deviation fails the whole resolution. Nothing is coerced.
pub fn resolve(catalog: &Catalog, required: &[CounterExpectation]) -> Result<CounterSet> {
    let mut counters = Vec::with_capacity(required.len());

    for (slot, expected) in required.iter().enumerate() {
        let mut matches = catalog.entries.iter().filter(|e| e.name == expected.name);
        let entry = matches.next().ok_or_else(|| ProbeError::CounterNotFound {
            query: catalog.query.clone(),
            counter: expected.name.to_string(),
        })?;
        let extra = matches.count();
        if extra > 0 {
            return Err(ProbeError::DuplicateCounter {
                query: catalog.query.clone(),
                counter: expected.name.to_string(),
                count: extra + 1,
            });
        }

        if entry.data_type != expected.data_type {
            return Err(ProbeError::CounterTypeMismatch {
                counter: entry.name.clone(),
                expected: expected.data_type,
                actual: entry.data_type,
            });
        }
        if let Some(class) = expected.class
            && entry.class != Some(class)
        {
            return Err(ProbeError::CounterClassMismatch {
                counter: entry.name.clone(),
                expected: class,
                actual: entry.class,
            });
        }
        if let Some(size) = entry.data_size
            && size != entry.data_type.size()
        {
            return Err(ProbeError::CounterSizeMismatch {
                counter: entry.name.clone(),
                data_type: entry.data_type,
                expected: entry.data_type.size(),
                actual: size,
            });
        }

        let locator = match entry.locator {
            CatalogLocator::Offset(offset) => Locator::Offset(offset),
            CatalogLocator::Index(catalog_index) => Locator::Index {
                slot,
                catalog_index,
            },
        };
        debug!(
            query = %catalog.query,
            counter = %entry.name,
            ?locator,
            data_type = ?entry.data_type,
            "resolved counter"
        );
        counters.push(CounterDescriptor {
            name: entry.name.clone(),
            role: expected.role,
            data_type: entry.data_type,
            class: entry.class,
            locator,
        });
    }

    let result_size = catalog
        .result_size
        .unwrap_or(counters.len() * RESULT_SLOT_SIZE);
    for counter in &counters {
        let offset = counter.byte_offset();
        let size = counter.data_type.size();
        if offset + size > result_size {
            return Err(ProbeError::CounterOutOfRange {
                counter: counter.name.clone(),
                offset,
                size,
                result_size,
            });
        }
    }

    Ok(CounterSet {
        query: catalog.query.clone(),
        counters,
        result_size,
    })
}
