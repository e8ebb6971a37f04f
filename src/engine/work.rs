// Deterministic CPU-bound work shared by the sync and async paths

//! # Work Processor
//!
//! `WorkProcessor::compute` is a pure function of its inputs: the same data and
//! complexity always produce the same `WorkOutput`. It burns CPU in proportion
//! to `complexity` and never sleeps or performs I/O, so callers on an async
//! runtime run it with `spawn_blocking`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{Result, ServiceError};

pub const MIN_COMPLEXITY: u32 = 1;
pub const MAX_COMPLEXITY: u32 = 10;

/// Upper bound on the serialized size of a work payload
pub const MAX_PAYLOAD_BYTES: usize = 10_000;

/// Upper bound on nested objects/arrays in a work payload
pub const MAX_PAYLOAD_DEPTH: usize = 10;

const ITERATIONS_PER_LEVEL: u64 = 1_000;

const SUSPICIOUS_PATTERNS: [&str; 4] = ["<script", "javascript:", "eval(", "exec("];

/// Output of one computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOutput {
    /// Sum of every numeric leaf in the payload
    pub sum: f64,
    /// Product of every numeric leaf in the payload (1 when there are none)
    pub product: f64,
    /// Number of mixing iterations performed
    pub operations: u64,
    pub computed_value: f64,
    pub complexity_level: u32,
    /// SHA-256 of the canonical JSON encoding of the payload
    pub data_checksum: String,
}

pub struct WorkProcessor;

impl WorkProcessor {
    /// Check a payload before it is accepted.
    ///
    /// Rejects anything that is not a non-empty object, payloads over
    /// `MAX_PAYLOAD_BYTES`, nesting deeper than `MAX_PAYLOAD_DEPTH` and strings
    /// carrying script-injection markers.
    pub fn validate_input(data: &Value) -> Result<()> {
        let object = data
            .as_object()
            .ok_or_else(|| ServiceError::InvalidInput("data must be a JSON object".to_string()))?;
        if object.is_empty() {
            return Err(ServiceError::InvalidInput(
                "data must contain at least one field".to_string(),
            ));
        }

        let encoded = serde_json::to_string(data)?;
        if encoded.len() > MAX_PAYLOAD_BYTES {
            return Err(ServiceError::InvalidInput(format!(
                "data exceeds {MAX_PAYLOAD_BYTES} bytes"
            )));
        }

        if nesting_depth(data) > MAX_PAYLOAD_DEPTH {
            return Err(ServiceError::InvalidInput(format!(
                "data is nested deeper than {MAX_PAYLOAD_DEPTH} levels"
            )));
        }

        let lowered = encoded.to_ascii_lowercase();
        if let Some(pattern) = SUSPICIOUS_PATTERNS.iter().find(|p| lowered.contains(*p)) {
            return Err(ServiceError::InvalidInput(format!(
                "data contains a disallowed pattern: {pattern}"
            )));
        }

        Ok(())
    }

    /// Run the computation.
    ///
    /// ## Errors
    /// `ServiceError::Computation` when complexity is outside 1..=10, the data is
    /// not a non-empty object, or the numeric aggregates overflow.
    pub fn compute(data: &Value, complexity: u32) -> Result<WorkOutput> {
        if !(MIN_COMPLEXITY..=MAX_COMPLEXITY).contains(&complexity) {
            return Err(ServiceError::Computation(format!(
                "complexity must be between {MIN_COMPLEXITY} and {MAX_COMPLEXITY}, got {complexity}"
            )));
        }
        match data.as_object() {
            Some(object) if !object.is_empty() => {}
            _ => {
                return Err(ServiceError::Computation(
                    "data must be a non-empty JSON object".to_string(),
                ))
            }
        }

        let mut numbers = Vec::new();
        collect_numbers(data, &mut numbers);

        let sum: f64 = numbers.iter().sum();
        let product: f64 = numbers.iter().product();
        if !sum.is_finite() || !product.is_finite() {
            return Err(ServiceError::Computation(
                "numeric aggregate overflowed".to_string(),
            ));
        }

        // serde_json keeps object keys sorted, so the encoding is canonical
        let canonical = serde_json::to_vec(data)?;
        let digest = Sha256::digest(&canonical);
        let mut seed_bytes = [0u8; 8];
        seed_bytes.copy_from_slice(&digest[..8]);
        let seed = (u64::from_be_bytes(seed_bytes) % 1_000_000) as f64;

        let iterations = u64::from(complexity) * ITERATIONS_PER_LEVEL;
        let mut value = 0.0_f64;
        for i in 0..iterations {
            let step = i as f64;
            value += (seed + step).sin() * step.cos();
            value = if value != 0.0 { value.abs().sqrt() } else { 1.0 };
        }

        Ok(WorkOutput {
            sum,
            product,
            operations: iterations,
            computed_value: (value * 1e6).round() / 1e6,
            complexity_level: complexity,
            data_checksum: format!("{digest:x}"),
        })
    }
}

fn collect_numbers(value: &Value, out: &mut Vec<f64>) {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                out.push(f);
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_numbers(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_numbers(item, out)),
        _ => {}
    }
}

fn nesting_depth(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(nesting_depth).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(nesting_depth).max().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compute_is_deterministic() {
        let data = json!({"x": 3, "y": [1.5, 2], "name": "abc"});
        let first = WorkProcessor::compute(&data, 2).unwrap();
        let second = WorkProcessor::compute(&data, 2).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_aggregates() {
        let data = json!({"a": 2, "b": [3, 4], "c": {"d": 0.5}, "label": "ignored"});
        let output = WorkProcessor::compute(&data, 1).unwrap();

        assert_eq!(output.sum, 9.5);
        assert_eq!(output.product, 12.0);
        assert_eq!(output.operations, 1_000);
        assert_eq!(output.complexity_level, 1);
        assert_eq!(output.data_checksum.len(), 64);
    }

    #[test]
    fn test_operations_scale_with_complexity() {
        let data = json!({"a": 1});
        assert_eq!(WorkProcessor::compute(&data, 7).unwrap().operations, 7_000);
    }

    #[test]
    fn test_no_numbers_gives_neutral_aggregates() {
        let output = WorkProcessor::compute(&json!({"name": "x"}), 1).unwrap();
        assert_eq!(output.sum, 0.0);
        assert_eq!(output.product, 1.0);
    }

    #[test]
    fn test_different_inputs_have_different_checksums() {
        let a = WorkProcessor::compute(&json!({"a": 1}), 1).unwrap();
        let b = WorkProcessor::compute(&json!({"a": 2}), 1).unwrap();
        assert_ne!(a.data_checksum, b.data_checksum);
    }

    #[test]
    fn test_complexity_out_of_range() {
        let data = json!({"a": 1});
        assert!(matches!(
            WorkProcessor::compute(&data, 0),
            Err(ServiceError::Computation(_))
        ));
        assert!(matches!(
            WorkProcessor::compute(&data, 11),
            Err(ServiceError::Computation(_))
        ));
    }

    #[test]
    fn test_non_object_or_empty_data_fails() {
        assert!(WorkProcessor::compute(&json!([1, 2]), 1).is_err());
        assert!(WorkProcessor::compute(&json!({}), 1).is_err());
    }

    #[test]
    fn test_overflow_fails() {
        let data = json!({"a": 1e300, "b": 1e300});
        assert!(matches!(
            WorkProcessor::compute(&data, 1),
            Err(ServiceError::Computation(_))
        ));
    }

    #[test]
    fn test_validate_accepts_ordinary_payload() {
        assert!(WorkProcessor::validate_input(&json!({"user": "a", "values": [1, 2, 3]})).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_payloads() {
        assert!(WorkProcessor::validate_input(&json!("text")).is_err());
        assert!(WorkProcessor::validate_input(&json!({})).is_err());
        assert!(WorkProcessor::validate_input(&json!({"x": "<SCRIPT>alert(1)"})).is_err());
        assert!(WorkProcessor::validate_input(&json!({"x": "eval(1)"})).is_err());

        let big = "a".repeat(MAX_PAYLOAD_BYTES + 1);
        assert!(WorkProcessor::validate_input(&json!({ "x": big })).is_err());
    }

    #[test]
    fn test_validate_depth_limit() {
        let mut nested = json!(1);
        for _ in 0..MAX_PAYLOAD_DEPTH {
            nested = json!({ "n": nested });
        }
        assert!(WorkProcessor::validate_input(&nested).is_ok());

        let too_deep = json!({ "n": nested });
        assert!(WorkProcessor::validate_input(&too_deep).is_err());
    }
}
