//! Element-wise comparison of computed tensors against reference tensors.

use std::fmt;

use serde::Serialize;

use layerdrive_utils::{config::ComparisonSettings, encode_value};

/// Acceptance threshold and report size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComparisonConfig {
    /// Largest accepted |relative error|, in percent.
    pub threshold_pct: f64,
    /// Number of leading elements listed in the report.
    pub preview_rows: usize,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            threshold_pct: 0.01,
            preview_rows: 10,
        }
    }
}

impl From<&ComparisonSettings> for ComparisonConfig {
    fn from(settings: &ComparisonSettings) -> Self {
        Self {
            threshold_pct: settings.threshold_pct,
            preview_rows: settings.preview_rows,
        }
    }
}

/// One compared element.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementComparison {
    pub index: usize,
    pub actual: f32,
    pub expected: f32,
    pub relative_error_pct: f64,
    pub actual_hex: String,
}

/// Outcome of comparing one tensor with its reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonReport {
    pub label: String,
    pub threshold_pct: f64,
    pub actual_len: usize,
    pub expected_len: usize,
    pub compared: usize,
    pub mismatches: usize,
    pub max_abs_error_pct: f64,
    pub mean_abs_error_pct: f64,
    pub preview: Vec<ElementComparison>,
}

impl ComparisonReport {
    pub fn length_mismatch(&self) -> bool {
        self.actual_len != self.expected_len
    }

    /// No element over the threshold and both tensors the same length.
    pub fn passed(&self) -> bool {
        self.mismatches == 0 && !self.length_mismatch()
    }
}

impl fmt::Display for ComparisonReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "== {} ==", self.label)?;
        writeln!(
            f,
            "{:>8}  {:>16}  {:>16}  {:>14}  {:>10}",
            "index", "actual", "expected", "rel err %", "hex"
        )?;
        for row in &self.preview {
            writeln!(
                f,
                "{:>8}  {:>16.8e}  {:>16.8e}  {:>14.6}  {:>10}",
                row.index, row.actual, row.expected, row.relative_error_pct, row.actual_hex
            )?;
        }
        if self.length_mismatch() {
            writeln!(
                f,
                "length mismatch: computed {} values, reference has {}",
                self.actual_len, self.expected_len
            )?;
        }
        write!(
            f,
            "{}: {} of {} values exceed {}% (max {:.6}%, mean {:.6}%)",
            if self.passed() { "PASS" } else { "FAIL" },
            self.mismatches,
            self.compared,
            self.threshold_pct,
            self.max_abs_error_pct,
            self.mean_abs_error_pct
        )
    }
}

/// Signed relative error of `actual` against `expected`, in percent.
///
/// A zero reference counts as zero error.
pub fn relative_error_pct(actual: f32, expected: f32) -> f64 {
    if expected == 0.0 {
        return 0.0;
    }
    let expected = f64::from(expected);
    (f64::from(actual) - expected) / expected * 100.0
}

/// Compare the common prefix of `actual` and `expected`.
///
/// An element is a mismatch when its |relative error| exceeds the threshold or is NaN.
pub fn compare(
    label: impl Into<String>,
    actual: &[f32],
    expected: &[f32],
    config: &ComparisonConfig,
) -> ComparisonReport {
    let compared = actual.len().min(expected.len());
    let mut mismatches = 0;
    let mut max_abs = 0.0f64;
    let mut sum_abs = 0.0f64;
    let mut preview = Vec::with_capacity(config.preview_rows.min(compared));

    for (index, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        let error = relative_error_pct(a, e);
        let magnitude = error.abs();
        if magnitude.is_nan() || magnitude > config.threshold_pct {
            mismatches += 1;
        }
        if !magnitude.is_nan() {
            max_abs = max_abs.max(magnitude);
            sum_abs += magnitude;
        }
        if index < config.preview_rows {
            preview.push(ElementComparison {
                index,
                actual: a,
                expected: e,
                relative_error_pct: error,
                actual_hex: encode_value(a),
            });
        }
    }

    ComparisonReport {
        label: label.into(),
        threshold_pct: config.threshold_pct,
        actual_len: actual.len(),
        expected_len: expected.len(),
        compared,
        mismatches,
        max_abs_error_pct: max_abs,
        mean_abs_error_pct: if compared == 0 {
            0.0
        } else {
            sum_abs / compared as f64
        },
        preview,
    }
}
