//! # Pipeline Request
//!
//! The unit of work threaded through every stage. Wire names are camelCase and the
//! legacy spellings (`requestHash`, `file`, `nProces`, `pressureLevel`) are accepted.
//! Selectors may arrive as numbers or strings and are normalized to strings.
//!
//! [`PipelineRequest::validated`] separates hard failures (the request is refused with
//! an ERROR result) from warnings (logged and reported as progress).

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use super::errors::{OrchestrationError, OrchestrationResult};
use crate::constants::variable_code;

fn default_count() -> u32 {
    1
}

fn scalar_to_string<E: de::Error>(value: Value) -> Result<String, E> {
    match value {
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(E::custom(format!(
            "expected a number or string selector, got {}",
            other
        ))),
    }
}

/// Accept `[1, "2"]`, a single scalar, or null
fn selector_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items.into_iter().map(scalar_to_string).collect(),
        Some(scalar) => Ok(vec![scalar_to_string(scalar)?]),
    }
}

/// Accept `4` or `"4"`
fn count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(default_count()),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| de::Error::custom(format!("invalid count {}", n))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid count {:?}", s))),
        Some(other) => Err(de::Error::custom(format!("invalid count {}", other))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRequest {
    #[serde(alias = "requestHash")]
    #[validate(length(min = 1))]
    pub request_id: String,

    /// Prepared input file; set by the configurator
    #[serde(default, alias = "file", skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,

    #[serde(default)]
    pub variable_name: String,

    #[serde(default, alias = "pressureLevel", deserialize_with = "selector_list")]
    pub pressure_levels: Vec<String>,
    #[serde(default, deserialize_with = "selector_list")]
    pub years: Vec<String>,
    #[serde(default, deserialize_with = "selector_list")]
    pub months: Vec<String>,
    #[serde(default, deserialize_with = "selector_list")]
    pub days: Vec<String>,
    #[serde(default, deserialize_with = "selector_list")]
    pub hours: Vec<String>,

    /// `[north, west, south, east]`
    #[serde(default, deserialize_with = "selector_list")]
    pub area_covered: Vec<String>,

    #[serde(default, deserialize_with = "selector_list")]
    pub map_types: Vec<String>,
    #[serde(default, deserialize_with = "selector_list")]
    pub map_ranges: Vec<String>,
    #[serde(default, deserialize_with = "selector_list")]
    pub map_levels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_format: Option<String>,

    #[serde(default)]
    pub no_compile: bool,
    #[serde(default)]
    pub no_execute: bool,
    #[serde(default)]
    pub no_maps: bool,
    #[serde(default)]
    pub no_data: bool,
    #[serde(default)]
    pub omp: bool,
    #[serde(default)]
    pub mpi: bool,
    #[serde(default)]
    pub tracking: bool,
    #[serde(default)]
    pub animation: bool,

    #[serde(default = "default_count", deserialize_with = "count")]
    #[validate(range(min = 1))]
    pub n_threads: u32,
    #[serde(default = "default_count", alias = "nProces", deserialize_with = "count")]
    #[validate(range(min = 1))]
    pub n_processes: u32,
}

/// Map rendering type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapType {
    #[serde(rename = "comb")]
    Combined,
    #[serde(rename = "disp")]
    Scatter,
    #[serde(rename = "cont")]
    Contour,
    #[serde(rename = "forms")]
    Formations,
    #[serde(rename = "3d")]
    ThreeD,
}

impl MapType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Combined => "comb",
            Self::Scatter => "disp",
            Self::Contour => "cont",
            Self::Formations => "forms",
            Self::ThreeD => "3d",
        }
    }
}

impl FromStr for MapType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "comb" => Ok(Self::Combined),
            "disp" => Ok(Self::Scatter),
            "cont" => Ok(Self::Contour),
            "forms" => Ok(Self::Formations),
            "3d" => Ok(Self::ThreeD),
            _ => Err(format!("unknown map type {:?}", s)),
        }
    }
}

impl fmt::Display for MapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rendered file format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Png,
    Jpg,
    Jpeg,
    #[default]
    Svg,
    Pdf,
}

impl FileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpg => "jpg",
            Self::Jpeg => "jpeg",
            Self::Svg => "svg",
            Self::Pdf => "pdf",
        }
    }
}

impl FromStr for FileFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "jpg" => Ok(Self::Jpg),
            "jpeg" => Ok(Self::Jpeg),
            "svg" => Ok(Self::Svg),
            "pdf" => Ok(Self::Pdf),
            _ => Err(format!("unknown file format {:?}", s)),
        }
    }
}

/// Area bounds, truncated to whole degrees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaBounds {
    pub north: i64,
    pub west: i64,
    pub south: i64,
    pub east: i64,
}

impl AreaBounds {
    /// Parse `[north, west, south, east]`
    pub fn parse(area: &[String]) -> Result<Self, String> {
        if area.len() != 4 {
            return Err(format!(
                "areaCovered needs 4 values [north, west, south, east], got {}",
                area.len()
            ));
        }
        let mut values = [0i64; 4];
        for (slot, raw) in values.iter_mut().zip(area) {
            let parsed: f64 = raw
                .parse()
                .map_err(|_| format!("areaCovered value {:?} is not a number", raw))?;
            if !parsed.is_finite() {
                return Err(format!("areaCovered value {:?} is not finite", raw));
            }
            *slot = parsed.trunc() as i64;
        }
        Ok(Self {
            north: values[0],
            west: values[1],
            south: values[2],
            east: values[3],
        })
    }

    /// `[south, north]`
    pub fn lat_range(&self) -> [i64; 2] {
        [self.south, self.north]
    }

    /// `[west, east]`
    pub fn lon_range(&self) -> [i64; 2] {
        [self.west, self.east]
    }
}

/// Usable as a single path component
pub fn is_safe_identifier(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// A request that passed validation, with parsed selectors
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub request: PipelineRequest,
    /// Present whenever execution or maps are requested
    pub area: Option<AreaBounds>,
    pub map_types: Vec<MapType>,
    pub file_format: FileFormat,
    pub warnings: Vec<String>,
}

impl PipelineRequest {
    pub fn maps_requested(&self) -> bool {
        !self.no_maps
    }

    pub fn execution_requested(&self) -> bool {
        !self.no_execute
    }

    /// Check field rules and cross-field requirements
    pub fn validated(&self) -> OrchestrationResult<ValidatedRequest> {
        let id = self.request_id.clone();
        let invalid = |reason: String| OrchestrationError::invalid_request(&id, reason);

        self.validate()
            .map_err(|e| invalid(format!("field validation failed: {}", e)))?;

        // The id names the request's working directory
        if !is_safe_identifier(&self.request_id) {
            return Err(invalid(format!(
                "request id {:?} may only contain letters, digits, '-', '_' and '.'",
                self.request_id
            )));
        }

        let mut warnings = Vec::new();
        if variable_code(&self.variable_name).is_none() {
            warnings.push(format!("unknown variable name {:?}", self.variable_name));
        }
        // Accepted on the wire, but no stage produces them
        for (flag, set) in [("tracking", self.tracking), ("animation", self.animation)] {
            if set {
                warnings.push(format!("{} is not supported and was ignored", flag));
            }
        }

        let file_format = match self.file_format.as_deref() {
            None | Some("") => FileFormat::default(),
            Some(raw) => raw.parse().map_err(invalid)?,
        };
        let map_types = self
            .map_types
            .iter()
            .map(|raw| raw.parse::<MapType>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?;

        let area = if self.execution_requested() || self.maps_requested() {
            Some(AreaBounds::parse(&self.area_covered).map_err(invalid)?)
        } else {
            None
        };

        if self.execution_requested()
            && self.source_file.as_deref().map_or(true, str::is_empty)
        {
            return Err(invalid("execution requested without a source file".to_string()));
        }

        if self.maps_requested() {
            let selectors = [
                ("years", self.years.is_empty()),
                ("months", self.months.is_empty()),
                ("days", self.days.is_empty()),
                ("hours", self.hours.is_empty()),
                ("mapTypes", map_types.is_empty()),
                ("mapLevels", self.map_levels.is_empty()),
            ];
            let empty: Vec<&str> = selectors
                .iter()
                .filter(|(_, is_empty)| *is_empty)
                .map(|(name, _)| *name)
                .collect();
            if !empty.is_empty() {
                return Err(invalid(format!(
                    "maps requested but {} empty",
                    empty.join(", ")
                )));
            }
        }

        Ok(ValidatedRequest {
            request: self.clone(),
            area,
            map_types,
            file_format,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Value {
        json!({
            "requestHash": "abc123",
            "file": "/data/z_500hPa.nc",
            "variableName": "geopotential",
            "pressureLevel": [500],
            "years": ["2022"],
            "months": [3],
            "days": [14, 15],
            "hours": ["00", "12"],
            "areaCovered": [10, -20, -10, 20],
            "mapTypes": ["cont"],
            "mapRanges": ["max"],
            "mapLevels": [20],
            "nThreads": "4",
            "nProces": 2
        })
    }

    #[test]
    fn test_legacy_names_and_mixed_selectors() {
        let request: PipelineRequest = serde_json::from_value(base()).unwrap();
        assert_eq!(request.request_id, "abc123");
        assert_eq!(request.source_file.as_deref(), Some("/data/z_500hPa.nc"));
        assert_eq!(request.pressure_levels, vec!["500"]);
        assert_eq!(request.days, vec!["14", "15"]);
        assert_eq!(request.n_threads, 4);
        assert_eq!(request.n_processes, 2);
        assert!(!request.no_maps);
    }

    #[test]
    fn test_valid_request_defaults_to_svg() {
        let request: PipelineRequest = serde_json::from_value(base()).unwrap();
        let validated = request.validated().unwrap();
        assert_eq!(validated.file_format, FileFormat::Svg);
        assert_eq!(validated.map_types, vec![MapType::Contour]);
        let area = validated.area.unwrap();
        assert_eq!(area.lat_range(), [-10, 10]);
        assert_eq!(area.lon_range(), [-20, 20]);
        assert!(validated.warnings.is_empty());
    }

    #[test]
    fn test_unknown_map_type_is_hard_failure() {
        let mut raw = base();
        raw["mapTypes"] = json!(["cont", "heat"]);
        let request: PipelineRequest = serde_json::from_value(raw).unwrap();
        let err = request.validated().unwrap_err();
        assert!(err.to_string().contains("unknown map type"));
    }

    #[test]
    fn test_missing_area_is_hard_failure_only_when_needed() {
        let mut raw = base();
        raw["areaCovered"] = json!([]);
        let request: PipelineRequest = serde_json::from_value(raw.clone()).unwrap();
        assert!(request.validated().is_err());

        raw["noExecute"] = json!(true);
        raw["noMaps"] = json!(true);
        let request: PipelineRequest = serde_json::from_value(raw).unwrap();
        let validated = request.validated().unwrap();
        assert!(validated.area.is_none());
    }

    #[test]
    fn test_empty_map_selectors_with_maps_requested() {
        let mut raw = base();
        raw["mapLevels"] = json!([]);
        let request: PipelineRequest = serde_json::from_value(raw).unwrap();
        let err = request.validated().unwrap_err();
        assert!(err.to_string().contains("mapLevels"));
    }

    #[test]
    fn test_unknown_variable_is_warning() {
        let mut raw = base();
        raw["variableName"] = json!("humidity");
        let request: PipelineRequest = serde_json::from_value(raw).unwrap();
        let validated = request.validated().unwrap();
        assert_eq!(validated.warnings.len(), 1);
    }

    #[test]
    fn test_tracking_and_animation_are_reported_unsupported() {
        let mut raw = base();
        raw["tracking"] = json!(true);
        raw["animation"] = json!(true);
        let request: PipelineRequest = serde_json::from_value(raw).unwrap();
        let validated = request.validated().unwrap();
        assert_eq!(
            validated.warnings,
            vec![
                "tracking is not supported and was ignored",
                "animation is not supported and was ignored",
            ]
        );
    }

    #[test]
    fn test_zero_threads_rejected() {
        let mut raw = base();
        raw["nThreads"] = json!(0);
        let request: PipelineRequest = serde_json::from_value(raw).unwrap();
        assert!(request.validated().is_err());
    }

    #[test]
    fn test_path_like_request_id_rejected() {
        let mut raw = base();
        raw["requestHash"] = json!("../etc");
        let request: PipelineRequest = serde_json::from_value(raw).unwrap();
        assert!(request.validated().is_err());
        assert!(is_safe_identifier("a1b2-c3_d4.v2"));
    }

    #[test]
    fn test_area_truncates_fractional_degrees() {
        let area = AreaBounds::parse(&[
            "45.9".to_string(),
            "-10.5".to_string(),
            "30.2".to_string(),
            "5".to_string(),
        ])
        .unwrap();
        assert_eq!(area.lat_range(), [30, 45]);
        assert_eq!(area.lon_range(), [-10, 5]);
    }
}
