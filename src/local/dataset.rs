//! Sensor records to standardized fixed-length windows.

use crate::core::{Error, Result, Timestamp};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use ndarray::{s, Array1, Array2, Array3, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

/// One timestamped reading from a drone's link telemetry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorRecord {
    pub timestamp: Timestamp,
    /// Feature values, same width for every record
    pub features: Vec<f32>,
    /// Class label (0 or 1 for the binary classifier)
    pub label: u8,
}

impl SensorRecord {
    pub fn new(timestamp: Timestamp, features: Vec<f32>, label: u8) -> Self {
        Self {
            timestamp,
            features,
            label,
        }
    }

    /// Read a labelled telemetry CSV file, sorted by timestamp.
    pub fn read_csv(path: impl AsRef<Path>, columns: &CsvColumns) -> Result<Vec<Self>> {
        let path = path.as_ref();
        let reader = csv::Reader::from_path(path)
            .map_err(|e| Error::Dataset(format!("{}: {}", path.display(), e)))?;
        Self::from_csv_reader(reader, columns)
    }

    /// Parse labelled telemetry from any CSV source with a header row.
    pub fn from_csv_reader<R: Read>(
        mut reader: csv::Reader<R>,
        columns: &CsvColumns,
    ) -> Result<Vec<Self>> {
        let headers = reader.headers().map_err(csv_error)?.clone();
        let layout = columns.resolve(&headers)?;

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row.map_err(csv_error)?;
            let line = row.position().map(|p| p.line()).unwrap_or_default();
            let field = |index: usize| row.get(index).unwrap_or_default().trim();

            let timestamp = parse_timestamp(field(layout.timestamp))
                .ok_or_else(|| bad_field(line, &columns.timestamp, field(layout.timestamp)))?;
            let features = layout
                .features
                .iter()
                .zip(&columns.features)
                .map(|(&index, name)| {
                    field(index)
                        .parse::<f32>()
                        .map_err(|_| bad_field(line, name, field(index)))
                })
                .collect::<Result<Vec<_>>>()?;
            let label = parse_label(field(layout.label))
                .ok_or_else(|| bad_field(line, &columns.label, field(layout.label)))?;

            records.push(Self::new(timestamp, features, label));
        }

        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }
}

/// Column names of a labelled telemetry CSV.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvColumns {
    pub timestamp: String,
    /// Feature columns, in window order
    pub features: Vec<String>,
    pub label: String,
}

impl Default for CsvColumns {
    /// The merged link telemetry each drone records.
    fn default() -> Self {
        Self {
            timestamp: "Timestamp".to_string(),
            features: [
                "Distance (m)",
                "RSSI (dBm)",
                "SNIR (dB)",
                "total_received",
                "drops_in_last_sec",
                "msgs_per_sec",
                "loss_rate",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            label: "label".to_string(),
        }
    }
}

/// Column positions resolved against a header row.
struct ColumnLayout {
    timestamp: usize,
    features: Vec<usize>,
    label: usize,
}

impl CsvColumns {
    pub fn new<I, S>(timestamp: &str, features: I, label: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            timestamp: timestamp.to_string(),
            features: features.into_iter().map(Into::into).collect(),
            label: label.to_string(),
        }
    }

    fn resolve(&self, headers: &csv::StringRecord) -> Result<ColumnLayout> {
        if self.features.is_empty() {
            return Err(Error::Dataset("no feature columns selected".into()));
        }
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or_else(|| Error::Dataset(format!("missing column {:?}", name)))
        };
        Ok(ColumnLayout {
            timestamp: find(&self.timestamp)?,
            features: self
                .features
                .iter()
                .map(|name| find(name))
                .collect::<Result<Vec<_>>>()?,
            label: find(&self.label)?,
        })
    }
}

fn csv_error(err: csv::Error) -> Error {
    Error::Dataset(err.to_string())
}

fn bad_field(line: u64, column: &str, value: &str) -> Error {
    Error::Dataset(format!("line {}: bad {:?} value {:?}", line, column, value))
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]` taken as UTC, or Unix seconds.
fn parse_timestamp(value: &str) -> Option<Timestamp> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    let seconds = value.parse::<f64>().ok().filter(|s| s.is_finite())?;
    let nanos = (seconds.fract() * 1e9).round() as u32;
    Utc.timestamp_opt(seconds.trunc() as i64, nanos).single()
}

/// Integer labels, also accepting `1.0` style floats.
fn parse_label(value: &str) -> Option<u8> {
    if let Ok(label) = value.parse::<u8>() {
        return Some(label);
    }
    let label = value.parse::<f64>().ok()?;
    if label.fract() == 0.0 && (0.0..=u8::MAX as f64).contains(&label) {
        Some(label as u8)
    } else {
        None
    }
}

/// Per-feature standardization to zero mean and unit variance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Array1<f32>,
    scale: Array1<f32>,
}

impl StandardScaler {
    /// Learn mean and standard deviation per column.
    ///
    /// Constant columns get a scale of 1 so they map to zero.
    pub fn fit(data: &Array2<f32>) -> Result<Self> {
        let mean = data
            .mean_axis(Axis(0))
            .ok_or_else(|| Error::Dataset("cannot fit scaler on empty data".into()))?;
        let scale = data
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > f32::EPSILON { s } else { 1.0 });
        Ok(Self { mean, scale })
    }

    pub fn transform(&self, data: &Array2<f32>) -> Result<Array2<f32>> {
        if data.ncols() != self.mean.len() {
            return Err(Error::Dataset(format!(
                "scaler fitted on {} features, got {}",
                self.mean.len(),
                data.ncols()
            )));
        }
        Ok((data - &self.mean) / &self.scale)
    }

    pub fn mean(&self) -> &Array1<f32> {
        &self.mean
    }

    pub fn scale(&self) -> &Array1<f32> {
        &self.scale
    }
}

/// Windows of shape `[seq_length, features]` with one label each.
#[derive(Clone, Debug, PartialEq)]
pub struct SequenceDataset {
    windows: Array3<f32>,
    labels: Vec<u8>,
}

impl SequenceDataset {
    /// Wrap precomputed windows.
    pub fn new(windows: Array3<f32>, labels: Vec<u8>) -> Result<Self> {
        if windows.len_of(Axis(0)) != labels.len() {
            return Err(Error::Dataset(format!(
                "{} windows but {} labels",
                windows.len_of(Axis(0)),
                labels.len()
            )));
        }
        Ok(Self { windows, labels })
    }

    /// Sort by time, standardize, and cut every window `i..i + seq_length`.
    ///
    /// Each window takes the label of its last record, giving
    /// `records.len() - seq_length + 1` windows.
    pub fn from_records(mut records: Vec<SensorRecord>, seq_length: usize) -> Result<Self> {
        if seq_length == 0 {
            return Err(Error::Dataset("sequence length must be positive".into()));
        }
        if records.len() < seq_length {
            return Err(Error::Dataset(format!(
                "{} records are fewer than the sequence length {}",
                records.len(),
                seq_length
            )));
        }
        let width = records[0].features.len();
        if width == 0 {
            return Err(Error::Dataset("records carry no features".into()));
        }
        if let Some(bad) = records.iter().find(|r| r.features.len() != width) {
            return Err(Error::Dataset(format!(
                "record at {} has {} features, expected {}",
                bad.timestamp,
                bad.features.len(),
                width
            )));
        }

        records.sort_by_key(|r| r.timestamp);

        let flat: Vec<f32> = records.iter().flat_map(|r| r.features.iter().copied()).collect();
        let data = Array2::from_shape_vec((records.len(), width), flat)
            .map_err(|e| Error::Dataset(e.to_string()))?;
        let scaled = StandardScaler::fit(&data)?.transform(&data)?;

        let count = records.len() - seq_length + 1;
        let mut windows = Array3::zeros((count, seq_length, width));
        let mut labels = Vec::with_capacity(count);
        for i in 0..count {
            windows
                .slice_mut(s![i, .., ..])
                .assign(&scaled.slice(s![i..i + seq_length, ..]));
            labels.push(records[i + seq_length - 1].label);
        }

        Ok(Self { windows, labels })
    }

    /// Number of windows.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn seq_length(&self) -> usize {
        self.windows.len_of(Axis(1))
    }

    pub fn num_features(&self) -> usize {
        self.windows.len_of(Axis(2))
    }

    pub fn window(&self, index: usize) -> ArrayView2<'_, f32> {
        self.windows.index_axis(Axis(0), index)
    }

    pub fn label(&self, index: usize) -> u8 {
        self.labels[index]
    }

    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    /// Windows at `indices`, in the given order.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            windows: self.windows.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }

    /// Split into `(train, test)` keeping each label's share in both halves.
    pub fn stratified_split(&self, test_fraction: f64, seed: u64) -> Result<(Self, Self)> {
        if !(test_fraction > 0.0 && test_fraction < 1.0) {
            return Err(Error::Dataset(format!(
                "test fraction must be within (0, 1), got {}",
                test_fraction
            )));
        }

        let mut by_label: BTreeMap<u8, Vec<usize>> = BTreeMap::new();
        for (index, label) in self.labels.iter().enumerate() {
            by_label.entry(*label).or_default().push(index);
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut train = Vec::new();
        let mut test = Vec::new();
        for (_, mut indices) in by_label {
            indices.shuffle(&mut rng);
            let n_test = ((indices.len() as f64 * test_fraction).round() as usize).min(indices.len());
            test.extend_from_slice(&indices[..n_test]);
            train.extend_from_slice(&indices[n_test..]);
        }

        if train.is_empty() || test.is_empty() {
            return Err(Error::Dataset(format!(
                "{} windows are too few to split at {}",
                self.len(),
                test_fraction
            )));
        }

        train.sort_unstable();
        test.sort_unstable();
        Ok((self.select(&train), self.select(&test)))
    }
}
