use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema};
use arrow_array::builder::{
    Float32Builder, Float64Builder, Int16Builder, Int32Builder, Int8Builder, StringBuilder,
};
use arrow_array::ArrayRef;
use parquet::arrow::arrow_writer::{compute_leaves, ArrowLeafColumn};
use parquet::errors::Result;

use crate::dataset::{Column, Dataset};
use crate::model::{FileMetadata, StorageType, Value, Variable};

pub fn arrow_type(storage: StorageType) -> DataType {
    match storage {
        StorageType::Int8 => DataType::Int8,
        StorageType::Int16 => DataType::Int16,
        StorageType::Int32 => DataType::Int32,
        StorageType::Float => DataType::Float32,
        StorageType::Double => DataType::Float64,
        StorageType::Text(_) | StorageType::LongText => DataType::Utf8,
    }
}

/// One nullable field per variable. Labels, formats and measures travel as
/// field metadata.
pub fn make_schema(vars: &[Variable]) -> Schema {
    let fields: Vec<Field> = vars
        .iter()
        .map(|v| {
            let mut meta = HashMap::new();
            if let Some(label) = &v.label {
                meta.insert("label".to_owned(), label.clone());
            }
            if let Some(format) = &v.print_format {
                meta.insert("format".to_owned(), format.clone());
            }
            meta.insert("measure".to_owned(), v.measure.to_string());
            Field::new(&v.name, arrow_type(v.storage), true).with_metadata(meta)
        })
        .collect();
    Schema::new(fields)
}

/// File-level facts stored as key/value metadata of the output.
pub fn file_metadata(meta: &FileMetadata) -> Vec<(String, String)> {
    let mut kv = vec![
        ("source_format".to_owned(), meta.kind.extension().to_owned()),
        ("source_version".to_owned(), meta.version.to_string()),
        ("source_encoding".to_owned(), meta.encoding.clone()),
    ];
    if let Some(label) = &meta.file_label {
        kv.push(("file_label".to_owned(), label.clone()));
    }
    if let Some(name) = &meta.table_name {
        kv.push(("table_name".to_owned(), name.clone()));
    }
    kv
}

macro_rules! build {
    ($builder:ty, $values:expr, $pattern:pat => $cell:expr) => {{
        let values = $values;
        let mut b = <$builder>::with_capacity(values.len());
        for value in values {
            match value {
                $pattern => b.append_value($cell),
                _ => b.append_null(),
            }
        }
        Arc::new(b.finish()) as ArrayRef
    }};
}

/// Missing values of every kind become nulls.
fn column_array(column: &Column, rows: Range<usize>) -> ArrayRef {
    let values = &column.values[rows];
    match column.variable.storage {
        StorageType::Int8 => build!(Int8Builder, values, Value::Int8(v) => *v),
        StorageType::Int16 => build!(Int16Builder, values, Value::Int16(v) => *v),
        StorageType::Int32 => build!(Int32Builder, values, Value::Int32(v) => *v),
        StorageType::Float => build!(Float32Builder, values, Value::Float(v) => *v),
        StorageType::Double => build!(Float64Builder, values, Value::Double(v) => *v),
        StorageType::Text(_) | StorageType::LongText => {
            let mut b = StringBuilder::with_capacity(values.len(), values.len() * 8);
            for value in values {
                match value {
                    Value::Text(s) => b.append_value(s),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
    }
}

/// Parquet leaves of every column for `rows`, in schema order.
pub fn build_columns(
    dataset: &Dataset,
    schema: &Schema,
    rows: Range<usize>,
) -> Result<Vec<ArrowLeafColumn>> {
    let mut leaves = Vec::with_capacity(dataset.var_count());
    for (column, field) in dataset.columns.iter().zip(schema.fields()) {
        let array = column_array(column, rows.clone());
        leaves.extend(compute_leaves(field, &array)?);
    }
    Ok(leaves)
}
