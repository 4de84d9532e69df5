//! Slice planning
//!
//! A slice is one bounded parameterization of a stream: a time window, a
//! quantity range, a parent partition, or nothing at all. Plans are
//! computed functionally from explicit bounds; planning the same inputs
//! twice yields the same windows.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{EngineError, Result};

/// Hard cap on time-window width
const MAX_STEP_DAYS: i64 = 63;

/// How window boundaries are rendered into query parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WindowFormat {
    /// Integer epoch seconds
    #[default]
    EpochSeconds,
    /// RFC 3339 timestamps
    Iso8601,
}

impl WindowFormat {
    fn render(&self, ts: DateTime<Utc>) -> String {
        match self {
            Self::EpochSeconds => ts.timestamp().to_string(),
            Self::Iso8601 => ts.to_rfc3339(),
        }
    }
}

/// Declarative slicing rule for one stream
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SliceConfig {
    /// One empty slice
    #[default]
    None,

    /// Contiguous `[start, end]` time windows of `step_secs` width
    TimeWindow(TimeWindowConfig),

    /// Contiguous `[min, min + step - 1]` quantity ranges
    QuantityRange(QuantityRangeConfig),

    /// One slice per parent record
    Parent,

    /// Time windows within each parent partition
    ParentTimeWindow(TimeWindowConfig),
}

impl SliceConfig {
    /// Whether slices come from a parent stream's records
    pub fn is_parent_driven(&self) -> bool {
        matches!(self, Self::Parent | Self::ParentTimeWindow(_))
    }
}

/// Time-window parameters
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct TimeWindowConfig {
    /// Window width in seconds (default 30 days, maximum 63 days)
    #[serde(default = "default_step_secs")]
    pub step_secs: u64,

    /// Query parameter carrying the window's lower bound
    #[serde(default = "default_start_param")]
    pub start_param: String,

    /// Query parameter carrying the window's upper bound
    #[serde(default = "default_end_param")]
    pub end_param: String,

    /// Rendering of the boundary timestamps
    #[serde(default)]
    pub format: WindowFormat,
}

fn default_step_secs() -> u64 {
    30 * 86_400
}

fn default_start_param() -> String {
    "start_time".to_string()
}

fn default_end_param() -> String {
    "end_time".to_string()
}

/// Quantity-range parameters
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct QuantityRangeConfig {
    /// Range width
    pub step: u64,

    /// Largest quantity covered by the plan
    pub upper_limit: u64,

    /// Query parameter carrying the range's lower bound
    #[serde(default = "default_min_param")]
    pub min_param: String,

    /// Query parameter carrying the range's upper bound
    #[serde(default = "default_max_param")]
    pub max_param: String,
}

fn default_min_param() -> String {
    "min_quantity".to_string()
}

fn default_max_param() -> String {
    "max_quantity".to_string()
}

/// One bounded parameterization of a stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Slice {
    /// Query parameters this slice contributes to every page request
    pub params: BTreeMap<String, String>,
    /// Partition identity for substream state, `{parent_id: ...}`
    pub partition: Option<Map<String, Value>>,
    /// The full parent record, for path interpolation and diagnostics
    pub parent: Option<Value>,
}

impl Slice {
    /// The unsliced whole-stream slice
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Bounds a window plan runs over
#[derive(Debug, Clone, Copy)]
pub struct WindowBounds {
    /// Lower bound (inclusive)
    pub start: DateTime<Utc>,
    /// Upper bound (inclusive); typically `now()` or a configured end date
    pub end: DateTime<Utc>,
}

/// Compute the slices executed within one partition (or for the whole
/// stream when there is no parent). Parent-driven configs contribute
/// their window plan here; the partition fan-out happens upstream.
pub fn plan_slices(config: &SliceConfig, bounds: WindowBounds) -> Result<Vec<Slice>> {
    match config {
        SliceConfig::None | SliceConfig::Parent => Ok(vec![Slice::empty()]),
        SliceConfig::TimeWindow(window) | SliceConfig::ParentTimeWindow(window) => {
            plan_time_windows(window, bounds)
        }
        SliceConfig::QuantityRange(range) => plan_quantity_ranges(range),
    }
}

fn plan_time_windows(config: &TimeWindowConfig, bounds: WindowBounds) -> Result<Vec<Slice>> {
    if config.step_secs == 0 {
        return Err(EngineError::config("time window step must be positive"));
    }
    let step = ChronoDuration::seconds(config.step_secs as i64);
    if step > ChronoDuration::days(MAX_STEP_DAYS) {
        return Err(EngineError::config(format!(
            "time window step exceeds the {MAX_STEP_DAYS}-day maximum"
        )));
    }

    let mut slices = Vec::new();
    let mut start = bounds.start;
    while start <= bounds.end {
        let end = (start + step - ChronoDuration::seconds(1)).min(bounds.end);
        let mut params = BTreeMap::new();
        params.insert(config.start_param.clone(), config.format.render(start));
        params.insert(config.end_param.clone(), config.format.render(end));
        slices.push(Slice {
            params,
            partition: None,
            parent: None,
        });
        start = end + ChronoDuration::seconds(1);
    }
    Ok(slices)
}

fn plan_quantity_ranges(config: &QuantityRangeConfig) -> Result<Vec<Slice>> {
    if config.step == 0 {
        return Err(EngineError::config("quantity range step must be positive"));
    }

    let mut slices = Vec::new();
    let mut min = 0u64;
    while min <= config.upper_limit {
        let max = min.saturating_add(config.step - 1).min(config.upper_limit);
        let mut params = BTreeMap::new();
        params.insert(config.min_param.clone(), min.to_string());
        params.insert(config.max_param.clone(), max.to_string());
        slices.push(Slice {
            params,
            partition: None,
            parent: None,
        });
        min = match max.checked_add(1) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(slices)
}

/// The effective lower bound of a window plan: state cursor first, then
/// the configured start date, then two years before `now`.
pub fn window_start(
    state_cursor: Option<DateTime<Utc>>,
    configured_start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    state_cursor
        .or(configured_start)
        .unwrap_or(now - ChronoDuration::days(730))
}

/// Interpret a state cursor value as a timestamp for window planning
pub fn cursor_as_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => Utc.timestamp_opt(n.as_i64()?, 0).single(),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn window_config(step_secs: u64) -> TimeWindowConfig {
        TimeWindowConfig {
            step_secs,
            start_param: default_start_param(),
            end_param: default_end_param(),
            format: WindowFormat::EpochSeconds,
        }
    }

    #[test]
    fn test_no_slicing_yields_one_empty_slice() {
        let bounds = WindowBounds {
            start: ts(0),
            end: ts(100),
        };
        let slices = plan_slices(&SliceConfig::None, bounds).unwrap();
        assert_eq!(slices, vec![Slice::empty()]);
    }

    #[test]
    fn test_time_windows_are_contiguous() {
        let bounds = WindowBounds {
            start: ts(1000),
            end: ts(1250),
        };
        let config = SliceConfig::TimeWindow(window_config(100));
        let slices = plan_slices(&config, bounds).unwrap();

        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].params["start_time"], "1000");
        assert_eq!(slices[0].params["end_time"], "1099");
        // Each window starts one second after the previous one ends
        assert_eq!(slices[1].params["start_time"], "1100");
        assert_eq!(slices[1].params["end_time"], "1199");
        // The final window is clipped to the upper bound
        assert_eq!(slices[2].params["start_time"], "1200");
        assert_eq!(slices[2].params["end_time"], "1250");
    }

    #[test]
    fn test_single_partial_window() {
        let bounds = WindowBounds {
            start: ts(1705312800),
            end: ts(1705312900),
        };
        let config = SliceConfig::TimeWindow(window_config(86_400));
        let slices = plan_slices(&config, bounds).unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].params["start_time"], "1705312800");
        assert_eq!(slices[0].params["end_time"], "1705312900");
    }

    #[test]
    fn test_step_cap_enforced() {
        let bounds = WindowBounds {
            start: ts(0),
            end: ts(100),
        };
        let config = SliceConfig::TimeWindow(window_config(64 * 86_400));
        assert!(matches!(
            plan_slices(&config, bounds).unwrap_err(),
            EngineError::Config(_)
        ));

        let config = SliceConfig::TimeWindow(window_config(63 * 86_400));
        assert!(plan_slices(&config, bounds).is_ok());
    }

    #[test]
    fn test_iso_window_rendering() {
        let bounds = WindowBounds {
            start: ts(1700000000),
            end: ts(1700000050),
        };
        let mut config = window_config(3600);
        config.format = WindowFormat::Iso8601;
        let slices = plan_slices(&SliceConfig::TimeWindow(config), bounds).unwrap();
        assert!(slices[0].params["start_time"].starts_with("2023-11-14T"));
    }

    #[test]
    fn test_quantity_ranges() {
        let config = SliceConfig::QuantityRange(QuantityRangeConfig {
            step: 100,
            upper_limit: 250,
            min_param: default_min_param(),
            max_param: default_max_param(),
        });
        let bounds = WindowBounds {
            start: ts(0),
            end: ts(0),
        };
        let slices = plan_slices(&config, bounds).unwrap();
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].params["min_quantity"], "0");
        assert_eq!(slices[0].params["max_quantity"], "99");
        assert_eq!(slices[2].params["min_quantity"], "200");
        assert_eq!(slices[2].params["max_quantity"], "250");
    }

    #[test]
    fn test_start_precedence() {
        let now = ts(2_000_000_000);
        assert_eq!(window_start(Some(ts(5)), Some(ts(10)), now), ts(5));
        assert_eq!(window_start(None, Some(ts(10)), now), ts(10));
        assert_eq!(
            window_start(None, None, now),
            now - ChronoDuration::days(730)
        );
    }

    #[test]
    fn test_cursor_as_timestamp() {
        assert_eq!(
            cursor_as_timestamp(&serde_json::json!(1705312800)),
            Some(ts(1705312800))
        );
        assert_eq!(
            cursor_as_timestamp(&serde_json::json!("2024-01-15T10:00:00Z")),
            Some(ts(1705312800))
        );
        assert_eq!(cursor_as_timestamp(&serde_json::json!(true)), None);
    }

    #[test]
    fn test_config_from_yaml() {
        let config: SliceConfig = serde_yaml::from_str(
            "type: time_window\nstep_secs: 2592000\n",
        )
        .unwrap();
        let SliceConfig::TimeWindow(window) = config else {
            panic!("expected a time window config");
        };
        assert_eq!(window.step_secs, 2_592_000);
        assert_eq!(window.start_param, "start_time");
        assert_eq!(window.format, WindowFormat::EpochSeconds);

        assert!(SliceConfig::Parent.is_parent_driven());
        assert!(!SliceConfig::None.is_parent_driven());
    }
}
