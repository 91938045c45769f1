//! Characteristics a statistics sensor can compute over its buffer

use std::fmt;

use chrono::{DateTime, Utc};
use ha_helpers::StateValue;
use serde::{Deserialize, Serialize};

use super::buffer::BufferSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Characteristic {
    AverageLinear,
    AverageStep,
    AverageTimeless,
    Change,
    ChangeSample,
    ChangeSecond,
    Count,
    CountOn,
    CountOff,
    DatetimeNewest,
    DatetimeOldest,
    DatetimeValueMax,
    DatetimeValueMin,
    #[serde(rename = "distance_95_percent_of_values")]
    Distance95,
    #[serde(rename = "distance_99_percent_of_values")]
    Distance99,
    DistanceAbsolute,
    Mean,
    MeanCircular,
    Median,
    Noisiness,
    Percentile,
    StandardDeviation,
    Sum,
    SumDifferences,
    SumDifferencesNonnegative,
    Total,
    ValueMax,
    ValueMin,
    Variance,
}

/// What a characteristic evaluates to before it is rounded
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Computed {
    Number(f64),
    Count(u64),
    Timestamp(DateTime<Utc>),
}

impl Computed {
    /// Round numbers to `precision` digits; precision 0 gives an integer
    pub fn into_state(self, precision: u32) -> StateValue {
        match self {
            Computed::Number(value) if precision == 0 => StateValue::Int(value.round() as i64),
            Computed::Number(value) => StateValue::Float(round_to(value, precision)),
            Computed::Count(count) => StateValue::Int(i64::try_from(count).unwrap_or(i64::MAX)),
            Computed::Timestamp(ts) => StateValue::Timestamp(ts),
        }
    }
}

fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision.min(15) as i32);
    (value * factor).round() / factor
}

impl Characteristic {
    pub fn supports_numeric(self) -> bool {
        !matches!(self, Characteristic::CountOn | Characteristic::CountOff)
    }

    pub fn supports_binary(self) -> bool {
        matches!(
            self,
            Characteristic::AverageStep
                | Characteristic::AverageTimeless
                | Characteristic::Count
                | Characteristic::CountOn
                | Characteristic::CountOff
                | Characteristic::DatetimeNewest
                | Characteristic::DatetimeOldest
                | Characteristic::Mean
        )
    }

    pub fn is_datetime(self) -> bool {
        matches!(
            self,
            Characteristic::DatetimeNewest
                | Characteristic::DatetimeOldest
                | Characteristic::DatetimeValueMax
                | Characteristic::DatetimeValueMin
        )
    }

    fn is_count(self) -> bool {
        matches!(
            self,
            Characteristic::Count | Characteristic::CountOn | Characteristic::CountOff
        )
    }

    /// Whether the result is in the unit of the source
    pub fn retains_unit(self, is_binary: bool) -> bool {
        !is_binary
            && !self.is_count()
            && !self.is_datetime()
            && !matches!(
                self,
                Characteristic::ChangeSample
                    | Characteristic::ChangeSecond
                    | Characteristic::Variance
            )
    }

    pub fn unit(self, source_unit: Option<&str>, is_binary: bool) -> Option<String> {
        if is_binary {
            return match self {
                Characteristic::AverageStep
                | Characteristic::AverageTimeless
                | Characteristic::Mean => Some("%".to_string()),
                _ => None,
            };
        }
        if self.is_count() || self.is_datetime() {
            return None;
        }
        let unit = source_unit?;
        Some(match self {
            Characteristic::ChangeSample => format!("{unit}/sample"),
            Characteristic::ChangeSecond => format!("{unit}/s"),
            Characteristic::Variance => format!("{unit}²"),
            _ => unit.to_string(),
        })
    }

    /// `timestamp` for datetimes; the source class only when the unit is
    /// kept and the source does not report a total
    pub fn device_class(
        self,
        source_device_class: Option<&str>,
        source_state_class: Option<&str>,
        is_binary: bool,
    ) -> Option<String> {
        if self.is_datetime() {
            return Some("timestamp".to_string());
        }
        if !self.retains_unit(is_binary)
            || matches!(source_state_class, Some("total" | "total_increasing"))
        {
            return None;
        }
        source_device_class.map(String::from)
    }

    pub fn is_measurement(self) -> bool {
        !self.is_datetime()
    }

    /// Evaluate over a pruned buffer
    ///
    /// Binary sources store `1.0` for on and `0.0` for off. `None` means the
    /// characteristic is undefined for these samples.
    pub fn compute(
        self,
        snapshot: &BufferSnapshot,
        is_binary: bool,
        percentile: u8,
    ) -> Option<Computed> {
        let values = snapshot.values.as_slice();
        let timestamps = snapshot.timestamps.as_slice();
        let n = values.len();

        let count = |pred: fn(f64) -> bool| values.iter().filter(|v| pred(**v)).count() as u64;
        match self {
            Characteristic::Count => return Some(Computed::Count(n as u64)),
            Characteristic::CountOn => return Some(Computed::Count(count(|v| v > 0.0))),
            Characteristic::CountOff => return Some(Computed::Count(count(|v| v <= 0.0))),
            _ => {}
        }
        if n == 0 {
            return None;
        }

        let ratio = if is_binary { 100.0 } else { 1.0 };
        let number = |v: f64| Some(Computed::Number(v));
        let first = values[0];
        let last = values[n - 1];

        match self {
            Characteristic::AverageLinear => average_linear(values, timestamps).and_then(number),
            Characteristic::AverageStep => {
                average_step(values, timestamps).and_then(|v| number(v * ratio))
            }
            Characteristic::AverageTimeless | Characteristic::Mean => number(mean(values) * ratio),
            Characteristic::Change => number(last - first),
            Characteristic::ChangeSample => {
                (n > 1).then(|| Computed::Number((last - first) / (n - 1) as f64))
            }
            Characteristic::ChangeSecond => {
                let span = span_seconds(timestamps)?;
                (span > 0.0).then(|| Computed::Number((last - first) / span))
            }
            Characteristic::DatetimeNewest => timestamps.last().copied().map(Computed::Timestamp),
            Characteristic::DatetimeOldest => timestamps.first().copied().map(Computed::Timestamp),
            Characteristic::DatetimeValueMax => {
                position_of(values, |a, b| a > b).map(|i| Computed::Timestamp(timestamps[i]))
            }
            Characteristic::DatetimeValueMin => {
                position_of(values, |a, b| a < b).map(|i| Computed::Timestamp(timestamps[i]))
            }
            Characteristic::Distance95 => number(2.0 * 1.96 * standard_deviation(values)),
            Characteristic::Distance99 => number(2.0 * 2.58 * standard_deviation(values)),
            Characteristic::DistanceAbsolute => number(max(values) - min(values)),
            Characteristic::MeanCircular => number(mean_circular(values)),
            Characteristic::Median => number(median(values)),
            Characteristic::Noisiness => {
                if n == 1 {
                    number(0.0)
                } else {
                    number(sum_differences(values) / (n - 1) as f64)
                }
            }
            Characteristic::Percentile => number(exclusive_percentile(values, percentile)),
            Characteristic::StandardDeviation => number(standard_deviation(values)),
            Characteristic::Sum | Characteristic::Total => number(values.iter().sum()),
            Characteristic::SumDifferences => number(sum_differences(values)),
            Characteristic::SumDifferencesNonnegative => number(
                values
                    .windows(2)
                    .map(|w| if w[1] >= w[0] { w[1] - w[0] } else { w[1] })
                    .sum(),
            ),
            Characteristic::ValueMax => number(max(values)),
            Characteristic::ValueMin => number(min(values)),
            Characteristic::Variance => number(variance(values)),
            Characteristic::Count | Characteristic::CountOn | Characteristic::CountOff => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Characteristic::AverageLinear => "average_linear",
            Characteristic::AverageStep => "average_step",
            Characteristic::AverageTimeless => "average_timeless",
            Characteristic::Change => "change",
            Characteristic::ChangeSample => "change_sample",
            Characteristic::ChangeSecond => "change_second",
            Characteristic::Count => "count",
            Characteristic::CountOn => "count_on",
            Characteristic::CountOff => "count_off",
            Characteristic::DatetimeNewest => "datetime_newest",
            Characteristic::DatetimeOldest => "datetime_oldest",
            Characteristic::DatetimeValueMax => "datetime_value_max",
            Characteristic::DatetimeValueMin => "datetime_value_min",
            Characteristic::Distance95 => "distance_95_percent_of_values",
            Characteristic::Distance99 => "distance_99_percent_of_values",
            Characteristic::DistanceAbsolute => "distance_absolute",
            Characteristic::Mean => "mean",
            Characteristic::MeanCircular => "mean_circular",
            Characteristic::Median => "median",
            Characteristic::Noisiness => "noisiness",
            Characteristic::Percentile => "percentile",
            Characteristic::StandardDeviation => "standard_deviation",
            Characteristic::Sum => "sum",
            Characteristic::SumDifferences => "sum_differences",
            Characteristic::SumDifferencesNonnegative => "sum_differences_nonnegative",
            Characteristic::Total => "total",
            Characteristic::ValueMax => "value_max",
            Characteristic::ValueMin => "value_min",
            Characteristic::Variance => "variance",
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn span_seconds(timestamps: &[DateTime<Utc>]) -> Option<f64> {
    let (first, last) = (timestamps.first()?, timestamps.last()?);
    Some((*last - *first).num_milliseconds() as f64 / 1000.0)
}

/// Seconds of each sample relative to the first one
fn offsets(timestamps: &[DateTime<Utc>]) -> Vec<f64> {
    let Some(first) = timestamps.first() else {
        return Vec::new();
    };
    timestamps
        .iter()
        .map(|ts| (*ts - *first).num_milliseconds() as f64 / 1000.0)
        .collect()
}

/// Time-weighted mean with straight lines between samples
fn average_linear(values: &[f64], timestamps: &[DateTime<Utc>]) -> Option<f64> {
    if values.len() == 1 {
        return Some(values[0]);
    }
    let ages = offsets(timestamps);
    let span = ages.last().copied()?;
    if span <= 0.0 {
        return None;
    }
    let area: f64 = (1..values.len())
        .map(|i| 0.5 * (values[i] + values[i - 1]) * (ages[i] - ages[i - 1]))
        .sum();
    Some(area / span)
}

/// Time-weighted mean where each value holds until the next sample
fn average_step(values: &[f64], timestamps: &[DateTime<Utc>]) -> Option<f64> {
    if values.len() == 1 {
        return Some(values[0]);
    }
    let ages = offsets(timestamps);
    let span = ages.last().copied()?;
    if span <= 0.0 {
        return None;
    }
    let area: f64 = (1..values.len())
        .map(|i| values[i - 1] * (ages[i] - ages[i - 1]))
        .sum();
    Some(area / span)
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Mean of angles in degrees, in `[0, 360)`
fn mean_circular(values: &[f64]) -> f64 {
    let (sin, cos) = values.iter().fold((0.0, 0.0), |(s, c), v| {
        let rad = v.to_radians();
        (s + rad.sin(), c + rad.cos())
    });
    (sin.atan2(cos).to_degrees() + 360.0) % 360.0
}

fn max(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

fn min(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

/// Index of the first value that wins `better` against all others
fn position_of(values: &[f64], better: fn(f64, f64) -> bool) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, v) in values.iter().enumerate() {
        match best {
            Some(b) if !better(*v, values[b]) => {}
            _ => best = Some(i),
        }
    }
    best
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted
}

fn median(values: &[f64]) -> f64 {
    let sorted = sorted(values);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Percentile with the "exclusive" method: interpolates between the ranks
/// of `n + 1` equally spaced cut points
fn exclusive_percentile(values: &[f64], percentile: u8) -> f64 {
    let data = sorted(values);
    let len = data.len();
    if len == 1 {
        return data[0];
    }
    let p = i64::from(percentile.clamp(1, 99));
    let m = len as i64 + 1;
    let j = (p * m / 100).clamp(1, len as i64 - 1);
    let delta = p * m - j * 100;
    let j = j as usize;
    (data[j - 1] * (100 - delta) as f64 + data[j] * delta as f64) / 100.0
}

/// Sample variance; zero for a single value
fn variance(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = mean(values);
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64
}

fn standard_deviation(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

fn sum_differences(values: &[f64]) -> f64 {
    values.windows(2).map(|w| (w[1] - w[0]).abs()).sum()
}
