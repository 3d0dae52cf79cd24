//! Sample container stored in a block's `chunks/` files.
//!
//! Every file is a Parquet file holding one row per (series, timestamp).
//! Raw rows carry `count == 1` with the sample value repeated in every
//! aggregate column; downsampled rows carry the window aggregates.

use std::{collections::BTreeMap, sync::Arc};

use arrow::{
    array::{ArrayRef, Float64Array, Int64Array, StringArray, UInt64Array},
    datatypes::{DataType, Field, Schema, SchemaRef},
    error::ArrowError,
    record_batch::RecordBatch,
};
use bytes::Bytes;
use parquet::{
    arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter},
    basic::Compression,
    errors::ParquetError,
    file::properties::WriterProperties,
};
use thiserror::Error;

/// Samples per chunk when counting `numChunks`.
pub const SAMPLES_PER_CHUNK: usize = 120;

/// Errors encoding or decoding block data.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// Arrow level failure.
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
    /// Parquet level failure.
    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),
    /// File does not have the expected columns.
    #[error("unexpected chunk schema: {0}")]
    Schema(String),
}

/// One stored row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggrSample {
    /// Timestamp in milliseconds.
    pub t: i64,
    /// Raw samples folded into this row.
    pub count: u64,
    /// Sum of values.
    pub sum: f64,
    /// Minimum value.
    pub min: f64,
    /// Maximum value.
    pub max: f64,
    /// Reset-adjusted counter value at `t`.
    pub counter: f64,
}

impl AggrSample {
    /// Row for a single raw sample.
    pub fn raw(t: i64, value: f64) -> Self {
        AggrSample {
            t,
            count: 1,
            sum: value,
            min: value,
            max: value,
            counter: value,
        }
    }
}

/// In-memory block data keyed by canonical series string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockData {
    series: BTreeMap<String, Vec<AggrSample>>,
}

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("series", DataType::Utf8, false),
        Field::new("timestamp", DataType::Int64, false),
        Field::new("count", DataType::UInt64, false),
        Field::new("sum", DataType::Float64, false),
        Field::new("min", DataType::Float64, false),
        Field::new("max", DataType::Float64, false),
        Field::new("counter", DataType::Float64, false),
    ]))
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, ChunkError> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<T>())
        .ok_or_else(|| ChunkError::Schema(format!("missing or mistyped column {name}")))
}

impl BlockData {
    /// Empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row to `series`. Rows are expected in timestamp order.
    pub fn push(&mut self, series: impl Into<String>, sample: AggrSample) {
        self.series.entry(series.into()).or_default().push(sample);
    }

    /// Rows of one series.
    pub fn samples(&self, series: &str) -> Option<&[AggrSample]> {
        self.series.get(series).map(Vec::as_slice)
    }

    /// Iterate series in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[AggrSample])> {
        self.series.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Returns `true` when no rows are stored.
    pub fn is_empty(&self) -> bool {
        self.series.values().all(Vec::is_empty)
    }

    /// Number of series with at least one row.
    pub fn num_series(&self) -> u64 {
        self.series.values().filter(|s| !s.is_empty()).count() as u64
    }

    /// Number of rows.
    pub fn num_samples(&self) -> u64 {
        self.series.values().map(|s| s.len() as u64).sum()
    }

    /// Number of chunks of up to [`SAMPLES_PER_CHUNK`] rows per series.
    pub fn num_chunks(&self) -> u64 {
        self.series
            .values()
            .map(|s| s.len().div_ceil(SAMPLES_PER_CHUNK) as u64)
            .sum()
    }

    /// Smallest and largest timestamp, if any row exists.
    pub fn time_bounds(&self) -> Option<(i64, i64)> {
        self.series
            .values()
            .flatten()
            .fold(None, |acc, s| match acc {
                None => Some((s.t, s.t)),
                Some((lo, hi)) => Some((lo.min(s.t), hi.max(s.t))),
            })
    }

    /// Concatenate `other` into `self`, keeping each series sorted by time.
    ///
    /// Rows with equal timestamps are all kept.
    pub fn merge(&mut self, other: BlockData) {
        for (series, samples) in other.series {
            let entry = self.series.entry(series).or_default();
            entry.extend(samples);
            entry.sort_by_key(|s| s.t);
        }
    }

    /// Encode as a Parquet file.
    pub fn encode(&self) -> Result<Bytes, ChunkError> {
        let rows = self.num_samples() as usize;
        let mut series = Vec::with_capacity(rows);
        let mut ts = Vec::with_capacity(rows);
        let mut count = Vec::with_capacity(rows);
        let mut sum = Vec::with_capacity(rows);
        let mut min = Vec::with_capacity(rows);
        let mut max = Vec::with_capacity(rows);
        let mut counter = Vec::with_capacity(rows);
        for (name, samples) in &self.series {
            for s in samples {
                series.push(name.as_str());
                ts.push(s.t);
                count.push(s.count);
                sum.push(s.sum);
                min.push(s.min);
                max.push(s.max);
                counter.push(s.counter);
            }
        }
        let schema = schema();
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(series)),
            Arc::new(Int64Array::from(ts)),
            Arc::new(UInt64Array::from(count)),
            Arc::new(Float64Array::from(sum)),
            Arc::new(Float64Array::from(min)),
            Arc::new(Float64Array::from(max)),
            Arc::new(Float64Array::from(counter)),
        ];
        let batch = RecordBatch::try_new(Arc::clone(&schema), columns)?;

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut buf = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buf, schema, Some(props))?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(Bytes::from(buf))
    }

    /// Decode one Parquet file.
    pub fn decode(file: Bytes) -> Result<Self, ChunkError> {
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        let mut data = BlockData::new();
        for batch in reader {
            let batch = batch?;
            let series = column::<StringArray>(&batch, "series")?;
            let ts = column::<Int64Array>(&batch, "timestamp")?;
            let count = column::<UInt64Array>(&batch, "count")?;
            let sum = column::<Float64Array>(&batch, "sum")?;
            let min = column::<Float64Array>(&batch, "min")?;
            let max = column::<Float64Array>(&batch, "max")?;
            let counter = column::<Float64Array>(&batch, "counter")?;
            for row in 0..batch.num_rows() {
                data.push(
                    series.value(row),
                    AggrSample {
                        t: ts.value(row),
                        count: count.value(row),
                        sum: sum.value(row),
                        min: min.value(row),
                        max: max.value(row),
                        counter: counter.value(row),
                    },
                );
            }
        }
        Ok(data)
    }

    /// Decode several files of one block into one container.
    pub fn decode_all(files: impl IntoIterator<Item = Bytes>) -> Result<Self, ChunkError> {
        let mut data = BlockData::new();
        for file in files {
            data.merge(BlockData::decode(file)?);
        }
        Ok(data)
    }
}
