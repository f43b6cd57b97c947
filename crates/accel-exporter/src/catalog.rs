//! Metric catalog feed
//!
//! Each CSV row selects one exported family:
//! `metric id, kind, display name, description, label...`.
//! Invalid rows are skipped individually with a diagnostic.

use crate::{ExporterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Locations searched when no catalog is configured
pub const DEFAULT_CATALOG_PATHS: [&str; 3] = [
    "/opt/maca/etc/default-counters.csv",
    "/opt/mxn100/etc/default-counters.csv",
    "./default-counters.csv",
];

/// Family kind named in the second column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricKind {
    Gauge,
    Counter,
    Summary,
    Histogram,
    Info,
}

impl MetricKind {
    /// Whether samples of this kind can be produced from collected values
    pub fn is_exportable(&self) -> bool {
        matches!(self, MetricKind::Gauge | MetricKind::Counter)
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Gauge" => Ok(MetricKind::Gauge),
            "Counter" => Ok(MetricKind::Counter),
            "Summary" => Ok(MetricKind::Summary),
            "Histogram" => Ok(MetricKind::Histogram),
            "Info" => Ok(MetricKind::Info),
            _ => Err(format!("Unknown metric kind: {}", s)),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::Gauge => "Gauge",
            MetricKind::Counter => "Counter",
            MetricKind::Summary => "Summary",
            MetricKind::Histogram => "Histogram",
            MetricKind::Info => "Info",
        };
        write!(f, "{}", name)
    }
}

/// One exported family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Metric id as known to the collectors
    pub id: String,
    pub kind: MetricKind,
    /// Prometheus family name
    pub name: String,
    pub help: String,
    pub labels: Vec<String>,
}

/// Families selected by the catalog feed, in file order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricCatalog {
    specs: Vec<MetricSpec>,
}

impl MetricCatalog {
    pub fn new(specs: Vec<MetricSpec>) -> Self {
        Self { specs }
    }

    /// Parse a catalog, keeping only rows whose id is in `supported`
    pub fn parse<R: Read>(reader: R, supported: &HashSet<&str>) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut specs: Vec<MetricSpec> = Vec::new();
        for (index, record) in csv_reader.records().enumerate() {
            let line = index + 1;
            let record = match record {
                Ok(record) => record,
                Err(e) if e.is_io_error() => return Err(e.into()),
                Err(e) => {
                    warn!("Skipping catalog row {}: {}", line, e);
                    continue;
                }
            };
            let fields: Vec<&str> = record.iter().collect();

            match parse_row(&fields, supported) {
                Ok(spec) => {
                    if specs.iter().any(|existing| existing.id == spec.id) {
                        warn!("Skipping catalog row {}: duplicate metric id {}", line, spec.id);
                        continue;
                    }
                    debug!("Catalog row {}: {} as {} {}", line, spec.id, spec.kind, spec.name);
                    specs.push(spec);
                }
                Err(reason) => warn!("Skipping catalog row {}: {}", line, reason),
            }
        }

        Ok(Self { specs })
    }

    /// Load a catalog file
    pub fn from_file<P: AsRef<Path>>(path: P, supported: &HashSet<&str>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref()).map_err(|e| {
            ExporterError::Catalog(format!(
                "Failed to open metric catalog {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let catalog = Self::parse(file, supported)?;
        info!(
            "Loaded {} metric families from {}",
            catalog.len(),
            path.as_ref().display()
        );
        Ok(catalog)
    }

    /// First existing file of [`DEFAULT_CATALOG_PATHS`]
    pub fn find_default() -> Option<PathBuf> {
        DEFAULT_CATALOG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_file())
    }

    pub fn specs(&self) -> &[MetricSpec] {
        &self.specs
    }

    pub fn get(&self, id: &str) -> Option<&MetricSpec> {
        self.specs.iter().find(|spec| spec.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Metric ids in file order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().map(|spec| spec.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

fn parse_row(fields: &[&str], supported: &HashSet<&str>) -> std::result::Result<MetricSpec, String> {
    let id = match fields.first() {
        None => return Err("empty row".to_string()),
        Some(id) if id.is_empty() && fields.len() == 1 => return Err("empty row".to_string()),
        Some(id) if id.starts_with('#') => return Err("comment".to_string()),
        Some(id) => *id,
    };

    if fields.len() < 4 {
        return Err(format!("expected at least 4 fields, found {}", fields.len()));
    }

    let kind: MetricKind = fields[1].parse()?;
    if !kind.is_exportable() {
        return Err(format!("{} families are not exported ({})", kind, id));
    }

    if !supported.contains(id) {
        return Err(format!("unsupported metric id {}", id));
    }

    Ok(MetricSpec {
        id: id.to_string(),
        kind,
        name: fields[2].to_string(),
        help: fields[3].to_string(),
        labels: fields[4..]
            .iter()
            .filter(|label| !label.is_empty())
            .map(|label| label.to_string())
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CATALOG: &str = "\
# metric id,kind,name,description,labels
chip_hotspot_temp,Gauge,accel_temperature,Hotspot temperature,deviceId,uuid,pod,namespace,container,host,driver,bios,name,dieId

board_power,Gauge,accel_board_power,Board power,rail,deviceId
driver_log_errors,Counter,accel_driver_log_errors,Driver log errors,submodule,level,deviceId
gpu_usage,Histogram,accel_gpu_usage,Usage histogram,deviceId
fan_speed,Gauge,accel_fan_speed,Fan speed,deviceId
memory_usage,Gauge
vpue_usage,Bogus,accel_vpue_usage,Encoder usage,deviceId
";

    fn supported() -> HashSet<&'static str> {
        [
            "chip_hotspot_temp",
            "board_power",
            "driver_log_errors",
            "gpu_usage",
            "memory_usage",
            "vpue_usage",
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_parse_skips_invalid_rows() {
        let catalog = MetricCatalog::parse(CATALOG.as_bytes(), &supported()).unwrap();

        let ids: Vec<&str> = catalog.ids().collect();
        assert_eq!(ids, vec!["chip_hotspot_temp", "board_power", "driver_log_errors"]);

        let temperature = catalog.get("chip_hotspot_temp").unwrap();
        assert_eq!(temperature.kind, MetricKind::Gauge);
        assert_eq!(temperature.name, "accel_temperature");
        assert_eq!(temperature.labels.len(), 10);

        let log_errors = catalog.get("driver_log_errors").unwrap();
        assert_eq!(log_errors.kind, MetricKind::Counter);
        assert_eq!(log_errors.labels, vec!["submodule", "level", "deviceId"]);
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let text = "board_power,Gauge,first,First,deviceId\nboard_power,Gauge,second,Second,deviceId\n";
        let catalog = MetricCatalog::parse(text.as_bytes(), &supported()).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("board_power").unwrap().name, "first");
    }

    #[test]
    fn test_undecodable_row_is_skipped() {
        let mut text = b"board_power,Gauge,accel_board_power,Board power,deviceId\n".to_vec();
        text.extend_from_slice(b"gpu_usage,Gauge,accel_gpu_usage,Usage \xff\xfe,deviceId\n");
        text.extend_from_slice(b"chip_hotspot_temp,Gauge,accel_temperature,Hotspot temperature,deviceId\n");

        let catalog = MetricCatalog::parse(text.as_slice(), &supported()).unwrap();
        let ids: Vec<&str> = catalog.ids().collect();
        assert_eq!(ids, vec!["board_power", "chip_hotspot_temp"]);
    }

    #[test]
    fn test_metric_kind_parsing() {
        assert_eq!("Counter".parse::<MetricKind>(), Ok(MetricKind::Counter));
        assert!("counter".parse::<MetricKind>().is_err());
        assert!(MetricKind::Gauge.is_exportable());
        assert!(!MetricKind::Info.is_exportable());
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counters.csv");
        std::fs::write(&path, CATALOG).unwrap();

        let catalog = MetricCatalog::from_file(&path, &supported()).unwrap();
        assert_eq!(catalog.len(), 3);

        let err = MetricCatalog::from_file(dir.path().join("missing.csv"), &supported()).unwrap_err();
        assert!(err.is_configuration_issue());
    }
}
