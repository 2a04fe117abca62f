use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use parquet::arrow::arrow_to_parquet_schema;
use parquet::arrow::arrow_writer::{get_column_writers, ArrowColumnChunk, ArrowLeafColumn};
use parquet::basic::Compression;
use parquet::errors::Result;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use rayon::prelude::*;

use crate::dataset::Dataset;
use crate::translate::{build_columns, file_metadata, make_schema};

/// Rows converted to arrow at a time.
pub const CHUNK_ROWS: usize = 10_000;

/// Writes `dataset` to `out_path` as a single row group. Row chunks are
/// converted in parallel, then each column writer runs on its own task.
pub fn write_dataset(out_path: &Path, dataset: &Dataset, compression: Compression) -> Result<()> {
    let schema = Arc::new(make_schema(&dataset.variables().cloned().collect::<Vec<_>>()));
    let parquet_schema = arrow_to_parquet_schema(&schema)?;
    let kv = dataset.metadata.as_ref().map(|m| {
        file_metadata(m)
            .into_iter()
            .map(|(k, v)| KeyValue::new(k, v))
            .collect()
    });
    let props = Arc::new(
        WriterProperties::builder()
            .set_compression(compression)
            .set_key_value_metadata(kv)
            .build(),
    );

    let rows = dataset.row_count();
    let chunks: Vec<Vec<ArrowLeafColumn>> = (0..rows)
        .step_by(CHUNK_ROWS)
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|start| build_columns(dataset, &schema, start..(start + CHUNK_ROWS).min(rows)))
        .collect::<Result<_>>()?;
    debug!("{} rows in {} chunks for {}", rows, chunks.len(), out_path.display());

    let out = File::create(out_path)?;
    let mut writer = SerializedFileWriter::new(out, parquet_schema.root_schema_ptr(), props.clone())?;
    let mut row_group = writer.next_row_group()?;
    let col_writers = get_column_writers(&parquet_schema, &props, &schema)?;
    let closed: Vec<ArrowColumnChunk> = col_writers
        .into_par_iter()
        .enumerate()
        .map(|(i, mut writer)| {
            for leaves in &chunks {
                writer.write(&leaves[i])?;
            }
            writer.close()
        })
        .collect::<Result<_>>()?;
    for chunk in closed {
        chunk.append_to_row_group(&mut row_group)?;
    }
    row_group.close()?;
    writer.close()?;
    Ok(())
}
