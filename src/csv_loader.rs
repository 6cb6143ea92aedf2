use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use csv::{ReaderBuilder, StringRecord};

use crate::schema::ChannelLayout;
use crate::types::RawSample;

const LABEL_HEADERS: [&str; 2] = ["gt", "label"];

/// Where each layout channel (and the label) lives in a CSV row
#[derive(Debug, PartialEq, Eq)]
struct ColumnMap {
    channels: Vec<usize>,
    label: Option<usize>,
}

impl ColumnMap {
    /// Columns are matched by header name when every channel is named in the header,
    /// otherwise by position (channels first, label last).
    fn from_headers(headers: &StringRecord, layout: &ChannelLayout) -> Result<Self> {
        let find = |name: &str| headers.iter().position(|h| h.trim() == name);

        let by_name: Option<Vec<usize>> = layout.channels.iter().map(|c| find(c)).collect();
        if let Some(channels) = by_name {
            let label = LABEL_HEADERS
                .iter()
                .find_map(|name| find(name))
                .filter(|_| layout.has_label);
            return Ok(Self { channels, label });
        }

        let needed = layout.len() + usize::from(layout.has_label);
        ensure!(
            headers.len() >= needed,
            "CSV has {} columns, layout needs {}",
            headers.len(),
            needed
        );
        Ok(Self {
            channels: (0..layout.len()).collect(),
            label: layout.has_label.then_some(layout.len()),
        })
    }
}

/// Loads a recorded session into samples, one per row.
pub fn load_samples_from_csv(
    path: impl AsRef<Path>,
    layout: &ChannelLayout,
) -> Result<Vec<RawSample>> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open CSV {:?}", path))?;

    let headers = reader
        .headers()
        .with_context(|| format!("Failed to read CSV header of {:?}", path))?
        .clone();
    let columns = ColumnMap::from_headers(&headers, layout)?;

    let mut samples = Vec::new();
    for (row_idx, result) in reader.records().enumerate() {
        let row = row_idx + 1;
        let record = result.with_context(|| format!("Invalid row {} in {:?}", row, path))?;
        samples.push(parse_record(&record, &columns).with_context(|| format!("row {}", row))?);
    }

    if samples.is_empty() {
        bail!("CSV {:?} contains no samples", path);
    }
    Ok(samples)
}

fn parse_record(record: &StringRecord, columns: &ColumnMap) -> Result<RawSample> {
    let field = |idx: usize| -> Result<f64> {
        let raw = record
            .get(idx)
            .with_context(|| format!("missing column {}", idx + 1))?;
        raw.parse::<f64>()
            .with_context(|| format!("invalid number '{}' in column {}", raw, idx + 1))
    };

    let values = columns
        .channels
        .iter()
        .map(|&idx| field(idx))
        .collect::<Result<Vec<_>>>()?;

    Ok(match columns.label {
        Some(idx) => RawSample::with_label(values, field(idx)?),
        None => RawSample::new(values),
    })
}
