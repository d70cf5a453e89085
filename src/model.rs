use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{IkatsError, Result};

// Intrinsic metadata, computed by the system on import
pub const META_START_DATE: &str = "ikats_start_date";
pub const META_END_DATE: &str = "ikats_end_date";
pub const META_NB_POINTS: &str = "qual_nb_points";

pub type Tags = BTreeMap<String, String>;
pub type Metadata = BTreeMap<String, MetaEntry>;

/// Functional identifier: the human-chosen name of a timeseries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fid(String);

impl Fid {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        check_identifier("fid", &value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Backend-unique identifier of a timeseries (metric uid + sorted tag uid pairs).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tsuid(String);

impl Tsuid {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(IkatsError::input("tsuid must not be empty"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Cuts the identifier into its fixed-width uid segments.
    pub fn segments(&self, width: usize) -> Vec<&str> {
        let mut out = Vec::with_capacity(self.0.len() / width.max(1) + 1);
        let mut rest = self.0.as_str();
        while !rest.is_empty() {
            let cut = rest.char_indices().nth(width).map(|(i, _)| i).unwrap_or(rest.len());
            let (head, tail) = rest.split_at(cut);
            out.push(head);
            rest = tail;
        }
        out
    }
}

macro_rules! string_newtype_impls {
    ($name:ident) => {
        impl TryFrom<String> for $name {
            type Error = IkatsError;
            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IkatsError;
            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }
    };
}

string_newtype_impls!(Fid);
string_newtype_impls!(Tsuid);

/// Shape rule shared by functional identifiers and dataset names.
pub fn check_identifier(kind: &str, value: &str) -> Result<()> {
    if value.chars().count() < 3 {
        return Err(IkatsError::input(format!("{} shall have at least 3 characters: '{}'", kind, value)));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(IkatsError::input(format!("{} shall not contain spaces: '{}'", kind, value)));
    }
    Ok(())
}

/// Validated `[start, end]` read range, in ms. `end == start` is widened by
/// one millisecond, backends reject empty ranges.
pub fn checked_range(start: i64, end: i64) -> Result<(i64, i64)> {
    if start < 0 {
        return Err(IkatsError::input(format!("start date must be positive (got: {})", start)));
    }
    if end < start {
        return Err(IkatsError::input(format!("end date must be greater than start date (got: {} < {})", end, start)));
    }
    Ok((start, if end == start { end + 1 } else { end }))
}

/// A single observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Milliseconds since epoch
    pub timestamp: i64,
    pub value: f64,
}

impl DataPoint {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

impl From<(i64, f64)> for DataPoint {
    fn from((timestamp, value): (i64, f64)) -> Self {
        Self { timestamp, value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MDType {
    #[default]
    String,
    Date,
    Number,
    Complex,
}

impl MDType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MDType::String => "string",
            MDType::Date => "date",
            MDType::Number => "number",
            MDType::Complex => "complex",
        }
    }
}

impl fmt::Display for MDType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MDType {
    type Err = IkatsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "string" => Ok(MDType::String),
            "date" => Ok(MDType::Date),
            "number" => Ok(MDType::Number),
            "complex" => Ok(MDType::Complex),
            other => Err(IkatsError::input(format!("unknown metadata type '{}'", other))),
        }
    }
}

/// Value of a metadata entry, along with its declared type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaEntry {
    pub value: String,
    pub dtype: MDType,
}

impl MetaEntry {
    pub fn new(value: impl Into<String>, dtype: MDType) -> Self {
        Self { value: value.into(), dtype }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.value.trim().parse().ok()
    }
}

/// Metric name and tags used to allocate a TSUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricTags {
    pub metric: String,
    pub tags: Tags,
}

/// FID ↔ TSUID association as stored by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FidRecord {
    pub tsuid: Tsuid,
    #[serde(rename = "funcId")]
    pub fid: Fid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub description: String,
    #[serde(rename = "fids", default)]
    pub timeseries: Vec<FidRecord>,
}

// --- TABLES ---

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableDesc {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "desc")]
    pub description: String,
}

/// Row or column header. `data[0]` is the corner cell for row headers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableHeader {
    pub data: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_links: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableHeaders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col: Option<TableHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<TableHeader>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableContent {
    pub cells: Vec<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_links: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<Value>>,
}

/// Table as exchanged with the datamodel. Unknown sections are rejected.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Table {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_desc: Option<TableDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<TableHeaders>,
    pub content: TableContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSummary {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "desc")]
    pub description: String,
}

// --- OPERATORS ---

/// Input, parameter or output of a catalog operator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InOutParam {
    pub name: String,
    pub label: Option<String>,
    pub description: Option<String>,
    pub domain: Option<Value>,
    pub order_index: Option<i64>,
    #[serde(rename = "type")]
    pub dtype: Option<String>,
    #[serde(rename = "default_values")]
    pub default_value: Option<Value>,
}

/// Catalog entry of an operator implementation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Operator {
    #[serde(rename = "id")]
    pub op_id: Option<i64>,
    pub name: String,
    pub label: Option<String>,
    pub description: Option<String>,
    pub family: Option<String>,
    pub inputs: Vec<InOutParam>,
    pub parameters: Vec<InOutParam>,
    pub outputs: Vec<InOutParam>,
}

/// Local view of a timeseries. Nothing is persisted until it is saved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeseries {
    pub tsuid: Option<Tsuid>,
    pub fid: Option<Fid>,
    pub data: Vec<DataPoint>,
    pub metadata: Metadata,
}

impl Timeseries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids(tsuid: Option<Tsuid>, fid: Option<Fid>) -> Self {
        Self { tsuid, fid, ..Self::default() }
    }
}

/// Outcome of a points import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub tsuid: Tsuid,
    /// Points handed to the store
    pub submitted: usize,
    /// Points the store reported as written
    pub nb_points: usize,
    /// Known range after back-fill (None when metadata generation was skipped)
    pub start_date: Option<i64>,
    pub end_date: Option<i64>,
    pub inherited: usize,
}

impl ImportSummary {
    pub fn is_partial(&self) -> bool {
        self.nb_points < self.submitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fid_shape() {
        assert!(Fid::new("abc").is_ok());
        assert!(Fid::new("ab").is_err());
        assert!(Fid::new("").is_err());
        assert!(Fid::new("has space").is_err());
        assert!(Fid::new("tab\there").is_err());
    }

    #[test]
    fn test_fid_deserialize_validates() {
        let ok: FidRecord = serde_json::from_str(r#"{"tsuid":"00000A","funcId":"FID_1"}"#).unwrap();
        assert_eq!(ok.fid.as_str(), "FID_1");
        assert!(serde_json::from_str::<FidRecord>(r#"{"tsuid":"00000A","funcId":"x"}"#).is_err());
    }

    #[test]
    fn test_tsuid_segments() {
        let tsuid = Tsuid::new("000001000002000003").unwrap();
        assert_eq!(tsuid.segments(6), vec!["000001", "000002", "000003"]);
        let odd = Tsuid::new("0000010002").unwrap();
        assert_eq!(odd.segments(6), vec!["000001", "0002"]);
    }

    #[test]
    fn test_checked_range() {
        assert_eq!(checked_range(10, 20).unwrap(), (10, 20));
        assert_eq!(checked_range(100, 100).unwrap(), (100, 101));
        assert!(matches!(checked_range(100, 10), Err(IkatsError::Input(_))));
        assert!(matches!(checked_range(-1, 10), Err(IkatsError::Input(_))));
    }

    #[test]
    fn test_mdtype_wire_names() {
        assert_eq!(serde_json::to_string(&MDType::Date).unwrap(), "\"date\"");
        assert_eq!("NUMBER".parse::<MDType>().unwrap(), MDType::Number);
        assert!("blob".parse::<MDType>().is_err());
    }
}
