//! In-memory reference consumer: collects a whole decode into columns.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use log::debug;

use crate::handler::{Handler, HandlerResult};
use crate::model::{FileMetadata, LabelKey, LabelSetId, Value, Variable};

/// Value labels of one label set, in the order the file lists them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueLabelTable {
    pub labels: IndexMap<LabelKey, String>,
}

impl ValueLabelTable {
    pub fn get(&self, value: &Value) -> Option<&str> {
        self.labels.get(&value.label_key()?).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    pub variable: Variable,
    pub labels: Option<Arc<ValueLabelTable>>,
    pub values: Vec<Value>,
}

#[derive(Debug, Default)]
pub struct Dataset {
    pub metadata: Option<FileMetadata>,
    pub columns: Vec<Column>,
    pending: HashMap<LabelSetId, ValueLabelTable>,
    shared: HashMap<LabelSetId, Arc<ValueLabelTable>>,
}

impl Dataset {
    pub fn new() -> Dataset {
        Dataset::default()
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map_or(0, |c| c.values.len())
    }

    pub fn var_count(&self) -> usize {
        self.columns.len()
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.columns.iter().map(|c| &c.variable)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.variable.name == name)
    }

    pub fn value(&self, var: usize, row: usize) -> Option<&Value> {
        self.columns.get(var)?.values.get(row)
    }

    /// The label of the cell at `(var, row)`, if its variable has a label
    /// set that covers the value.
    pub fn label(&self, var: usize, row: usize) -> Option<&str> {
        let column = self.columns.get(var)?;
        column.labels.as_ref()?.get(column.values.get(row)?)
    }
}

impl Handler for Dataset {
    fn on_metadata(&mut self, metadata: &FileMetadata) -> HandlerResult {
        self.metadata = Some(metadata.clone());
        self.columns = Vec::with_capacity(metadata.var_count);
        self.pending.clear();
        self.shared.clear();
        Ok(())
    }

    fn on_value_label(&mut self, set: LabelSetId, value: &Value, label: &str) -> HandlerResult {
        let Some(key) = value.label_key() else {
            debug!("ignoring label {label:?} in {set} on system missing");
            return Ok(());
        };
        self.pending
            .entry(set)
            .or_default()
            .labels
            .insert(key, label.to_owned());
        Ok(())
    }

    fn on_variable(
        &mut self,
        _index: usize,
        variable: &Variable,
        label_set: Option<LabelSetId>,
    ) -> HandlerResult {
        let labels = label_set.map(|id| {
            let pending = &mut self.pending;
            self.shared
                .entry(id)
                .or_insert_with(|| Arc::new(pending.remove(&id).unwrap_or_default()))
                .clone()
        });
        self.columns.push(Column {
            variable: variable.clone(),
            labels,
            values: Vec::new(),
        });
        Ok(())
    }

    fn on_finalize_variables(&mut self) -> HandlerResult {
        self.pending.clear();
        self.shared.clear();
        let rows = self.metadata.as_ref().map_or(0, |m| m.row_count);
        let rows = usize::try_from(rows).map_err(|_| format!("{rows} rows do not fit in memory"))?;
        for column in &mut self.columns {
            column.values = vec![Value::SystemMissing; rows];
        }
        Ok(())
    }

    fn on_value(&mut self, var_index: usize, row_index: u64, value: Value) -> HandlerResult {
        let cell = self
            .columns
            .get_mut(var_index)
            .and_then(|c| c.values.get_mut(row_index as usize))
            .ok_or_else(|| format!("value for ({var_index}, {row_index}) is out of range"))?;
        *cell = value;
        Ok(())
    }
}
