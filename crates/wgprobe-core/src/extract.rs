//! Decoding raw query results.
//!
//! Values are reinterpreted at the byte offsets recorded during resolution,
//! in host byte order, after a bounds check. The byte count the driver
//! reports must match the counter set's expected size exactly.

use std::collections::HashMap;

use tracing::debug;

use crate::counters::{CounterDataType, CounterDescriptor, CounterRole, CounterSet};
use crate::error::{ProbeError, Result};

/// Bounds-checked view over a raw result.
#[derive(Clone, Copy, Debug)]
pub struct ResultBuffer<'a> {
    bytes: &'a [u8],
}

impl<'a> ResultBuffer<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn array<const N: usize>(&self, offset: usize) -> Result<[u8; N]> {
        let out_of_bounds = || ProbeError::ResultOutOfBounds {
            offset,
            size: N,
            len: self.bytes.len(),
        };
        let end = offset.checked_add(N).ok_or_else(out_of_bounds)?;
        let slice = self.bytes.get(offset..end).ok_or_else(out_of_bounds)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        self.array(offset).map(u32::from_ne_bytes)
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        self.array(offset).map(u64::from_ne_bytes)
    }

    pub fn read_i32(&self, offset: usize) -> Result<i32> {
        self.array(offset).map(i32::from_ne_bytes)
    }

    pub fn read_i64(&self, offset: usize) -> Result<i64> {
        self.array(offset).map(i64::from_ne_bytes)
    }

    pub fn read_f32(&self, offset: usize) -> Result<f32> {
        self.array(offset).map(f32::from_ne_bytes)
    }

    pub fn read_f64(&self, offset: usize) -> Result<f64> {
        self.array(offset).map(f64::from_ne_bytes)
    }

    pub fn read(&self, offset: usize, data_type: CounterDataType) -> Result<CounterValue> {
        Ok(match data_type {
            CounterDataType::UInt32 => CounterValue::UInt32(self.read_u32(offset)?),
            CounterDataType::UInt64 => CounterValue::UInt64(self.read_u64(offset)?),
            CounterDataType::Int32 => CounterValue::Int32(self.read_i32(offset)?),
            CounterDataType::Int64 => CounterValue::Int64(self.read_i64(offset)?),
            CounterDataType::Float32 => CounterValue::Float32(self.read_f32(offset)?),
            CounterDataType::Float64 => CounterValue::Float64(self.read_f64(offset)?),
            CounterDataType::Bool32 => CounterValue::Bool32(self.read_u32(offset)? != 0),
            CounterDataType::Unknown(raw) => {
                return Err(ProbeError::InvalidConfig(format!(
                    "no decoding for counter data type {raw:#x} at offset {offset}"
                )));
            }
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CounterValue {
    UInt32(u32),
    UInt64(u64),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Bool32(bool),
}

impl CounterValue {
    pub fn as_u64(self) -> Option<u64> {
        match self {
            Self::UInt32(v) => Some(u64::from(v)),
            Self::UInt64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(self) -> Option<f32> {
        match self {
            Self::Float32(v) => Some(v),
            _ => None,
        }
    }
}

/// Decoded values of one or more counter sets, keyed by role.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtractedCounters {
    values: HashMap<CounterRole, (String, CounterValue)>,
}

impl ExtractedCounters {
    pub fn get(&self, role: CounterRole) -> Option<CounterValue> {
        self.values.get(&role).map(|(_, value)| *value)
    }

    pub fn merge(&mut self, other: ExtractedCounters) {
        self.values.extend(other.values);
    }

    fn missing(role: CounterRole) -> ProbeError {
        ProbeError::InvalidConfig(format!("no counter resolved for {role:?}"))
    }

    pub fn require_u64(&self, role: CounterRole) -> Result<u64> {
        let (name, value) = self.values.get(&role).ok_or_else(|| Self::missing(role))?;
        value.as_u64().ok_or_else(|| ProbeError::CounterTypeMismatch {
            counter: name.clone(),
            expected: CounterDataType::UInt64,
            actual: value.data_type(),
        })
    }

    pub fn require_f32(&self, role: CounterRole) -> Result<f32> {
        let (name, value) = self.values.get(&role).ok_or_else(|| Self::missing(role))?;
        value.as_f32().ok_or_else(|| ProbeError::CounterTypeMismatch {
            counter: name.clone(),
            expected: CounterDataType::Float32,
            actual: value.data_type(),
        })
    }
}

impl CounterValue {
    pub fn data_type(self) -> CounterDataType {
        match self {
            Self::UInt32(_) => CounterDataType::UInt32,
            Self::UInt64(_) => CounterDataType::UInt64,
            Self::Int32(_) => CounterDataType::Int32,
            Self::Int64(_) => CounterDataType::Int64,
            Self::Float32(_) => CounterDataType::Float32,
            Self::Float64(_) => CounterDataType::Float64,
            Self::Bool32(_) => CounterDataType::Bool32,
        }
    }
}

fn decode(buffer: &ResultBuffer<'_>, counter: &CounterDescriptor) -> Result<CounterValue> {
    buffer.read(counter.byte_offset(), counter.data_type)
}

/// Validate and decode one query's raw result.
///
/// `written` is the byte count the driver reported for the read.
pub fn extract(counters: &CounterSet, raw: &[u8], written: usize) -> Result<ExtractedCounters> {
    let expected = counters.result_size();
    if written != expected || raw.len() < expected {
        return Err(ProbeError::ResultSizeMismatch {
            query: counters.query().to_string(),
            expected,
            actual: written,
        });
    }
    let buffer = ResultBuffer::new(&raw[..expected]);
    debug!(
        query = counters.query(),
        words = ?raw_words(&buffer),
        "raw query result"
    );

    let mut values = HashMap::with_capacity(counters.len());
    for counter in counters.iter() {
        let value = decode(&buffer, counter)?;
        debug!(counter = %counter.name, ?value, "decoded counter");
        values.insert(counter.role, (counter.name.clone(), value));
    }
    Ok(ExtractedCounters { values })
}

fn raw_words(buffer: &ResultBuffer<'_>) -> Vec<u64> {
    (0..buffer.len() / 8)
        .filter_map(|i| buffer.read_u64(i * 8).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::{
        self, Catalog, CatalogEntry, CatalogLocator, CounterClass, LEGACY_METRICS,
        MODERN_METRICS, names,
    };

    fn legacy_set() -> CounterSet {
        let entry = |name: &str, data_type: CounterDataType, class, offset| CatalogEntry {
            name: name.into(),
            data_type,
            class: Some(class),
            data_size: Some(data_type.size()),
            locator: CatalogLocator::Offset(offset),
        };
        let catalog = Catalog {
            query: "Compute Metrics Basic Gen9".into(),
            entries: vec![
                entry(names::GPU_TIME_ELAPSED, CounterDataType::UInt64, CounterClass::Raw, 0),
                entry(names::CS_THREADS_DISPATCHED, CounterDataType::UInt64, CounterClass::Event, 8),
                entry(names::EU_THREAD_OCCUPANCY, CounterDataType::Float32, CounterClass::Raw, 20),
            ],
            result_size: Some(24),
        };
        counters::resolve(&catalog, LEGACY_METRICS).expect("legacy set")
    }

    fn modern_set() -> CounterSet {
        let entry = |name: &str, data_type, index| CatalogEntry {
            name: name.into(),
            data_type,
            class: None,
            data_size: None,
            locator: CatalogLocator::Index(index),
        };
        let catalog = Catalog {
            query: "VK_KHR_performance_query".into(),
            entries: vec![
                entry(names::CS_THREADS_DISPATCHED, CounterDataType::UInt64, 3),
                entry(names::EU_THREAD_OCCUPANCY, CounterDataType::Float32, 5),
                entry(names::GPU_TIME_ELAPSED, CounterDataType::UInt64, 8),
            ],
            result_size: None,
        };
        counters::resolve(&catalog, MODERN_METRICS).expect("modern set")
    }

    #[test]
    fn decodes_exact_values_at_legacy_offsets() {
        let set = legacy_set();
        let mut raw = vec![0xAAu8; 24];
        raw[0..8].copy_from_slice(&123_456_789u64.to_ne_bytes());
        raw[8..16].copy_from_slice(&4096u64.to_ne_bytes());
        raw[20..24].copy_from_slice(&87.625f32.to_ne_bytes());

        let values = extract(&set, &raw, 24).expect("extract");
        assert_eq!(values.require_u64(CounterRole::GpuTime).expect("gpu"), 123_456_789);
        assert_eq!(
            values
                .require_u64(CounterRole::ThreadsDispatched)
                .expect("threads"),
            4096
        );
        assert_eq!(
            values.require_f32(CounterRole::Occupancy).expect("occupancy").to_bits(),
            87.625f32.to_bits()
        );
    }

    #[test]
    fn decodes_modern_slots_in_selection_order() {
        let set = modern_set();
        // Slots follow the required list: occupancy, threads, gpu time.
        let mut raw = vec![0u8; 24];
        raw[0..4].copy_from_slice(&12.5f32.to_ne_bytes());
        raw[8..16].copy_from_slice(&64u64.to_ne_bytes());
        raw[16..24].copy_from_slice(&u64::MAX.to_ne_bytes());

        let values = extract(&set, &raw, 24).expect("extract");
        assert_eq!(values.get(CounterRole::Occupancy), Some(CounterValue::Float32(12.5)));
        assert_eq!(values.get(CounterRole::ThreadsDispatched), Some(CounterValue::UInt64(64)));
        assert_eq!(values.get(CounterRole::GpuTime), Some(CounterValue::UInt64(u64::MAX)));
    }

    #[test]
    fn short_read_is_result_integrity_error() {
        let set = legacy_set();
        let raw = vec![0u8; 24];
        let err = extract(&set, &raw, 16).expect_err("short count must fail");
        assert!(matches!(
            err,
            ProbeError::ResultSizeMismatch {
                expected: 24,
                actual: 16,
                ..
            }
        ));
    }

    #[test]
    fn long_read_is_also_rejected() {
        let set = modern_set();
        let raw = vec![0u8; 32];
        let err = extract(&set, &raw, 32).expect_err("long count must fail");
        assert!(matches!(err, ProbeError::ResultSizeMismatch { actual: 32, .. }));
    }

    #[test]
    fn buffer_reads_are_bounds_checked() {
        let raw = [1u8, 2, 3, 4, 5, 6];
        let buffer = ResultBuffer::new(&raw);
        assert_eq!(buffer.read_u32(2).expect("in bounds"), u32::from_ne_bytes([3, 4, 5, 6]));
        let err = buffer.read_u64(0).expect_err("past end");
        assert!(matches!(
            err,
            ProbeError::ResultOutOfBounds {
                offset: 0,
                size: 8,
                len: 6
            }
        ));
        assert!(buffer.read_u32(usize::MAX).is_err());
    }

    #[test]
    fn wrong_value_type_is_reported_with_counter_name() {
        let mut values = ExtractedCounters::default();
        values.values.insert(
            CounterRole::GpuTime,
            ("GPU Time Elapsed".into(), CounterValue::Float32(1.0)),
        );
        let err = values.require_u64(CounterRole::GpuTime).expect_err("float is not u64");
        assert!(err.to_string().contains("GPU Time Elapsed"));
    }
}
