//! The push interface between decoders and consumers.
//!
//! A decode delivers, in this order: one [Handler::on_metadata], any
//! interleaving of [Handler::on_value_label] and [Handler::on_variable], one
//! [Handler::on_finalize_variables], `row_count * var_count` calls to
//! [Handler::on_value] in row-major order, and one
//! [Handler::on_finalize_values]. Every label of a set arrives before the
//! first variable that refers to the set. Returning `Err` from any hook stops
//! the decode with [Error::Aborted] and no further events.

use log::trace;

use crate::error::{Error, HandlerError, Result};
use crate::model::{FileMetadata, LabelSetId, Value, Variable};

pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Consumer of decode events. Every hook defaults to doing nothing.
pub trait Handler {
    fn on_metadata(&mut self, _metadata: &FileMetadata) -> HandlerResult {
        Ok(())
    }

    fn on_value_label(&mut self, _set: LabelSetId, _value: &Value, _label: &str) -> HandlerResult {
        Ok(())
    }

    fn on_variable(
        &mut self,
        _index: usize,
        _variable: &Variable,
        _label_set: Option<LabelSetId>,
    ) -> HandlerResult {
        Ok(())
    }

    fn on_finalize_variables(&mut self) -> HandlerResult {
        Ok(())
    }

    fn on_value(&mut self, _var_index: usize, _row_index: u64, _value: Value) -> HandlerResult {
        Ok(())
    }

    fn on_finalize_values(&mut self) -> HandlerResult {
        Ok(())
    }
}

impl<H: Handler + ?Sized> Handler for &mut H {
    fn on_metadata(&mut self, metadata: &FileMetadata) -> HandlerResult {
        (**self).on_metadata(metadata)
    }

    fn on_value_label(&mut self, set: LabelSetId, value: &Value, label: &str) -> HandlerResult {
        (**self).on_value_label(set, value, label)
    }

    fn on_variable(
        &mut self,
        index: usize,
        variable: &Variable,
        label_set: Option<LabelSetId>,
    ) -> HandlerResult {
        (**self).on_variable(index, variable, label_set)
    }

    fn on_finalize_variables(&mut self) -> HandlerResult {
        (**self).on_finalize_variables()
    }

    fn on_value(&mut self, var_index: usize, row_index: u64, value: Value) -> HandlerResult {
        (**self).on_value(var_index, row_index, value)
    }

    fn on_finalize_values(&mut self) -> HandlerResult {
        (**self).on_finalize_values()
    }
}

/// Handler that ignores everything.
pub struct NullHandler;

impl Handler for NullHandler {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Dictionary,
    Values,
    Done,
    Poisoned,
}

/// Sits between a decoder and its handler, keeping the event stream in
/// protocol order and counting what was delivered.
pub struct Dispatcher<'h, H: Handler + ?Sized> {
    handler: &'h mut H,
    phase: Phase,
    var_count: usize,
    row_count: u64,
    variables: usize,
    values: u64,
}

impl<'h, H: Handler + ?Sized> Dispatcher<'h, H> {
    pub fn new(handler: &'h mut H) -> Self {
        Dispatcher {
            handler,
            phase: Phase::Start,
            var_count: 0,
            row_count: 0,
            variables: 0,
            values: 0,
        }
    }

    fn call(&mut self, result: HandlerResult) -> Result<()> {
        result.map_err(|e| {
            self.phase = Phase::Poisoned;
            Error::Aborted(e)
        })
    }

    fn expect(&self, phase: Phase, event: &str) {
        debug_assert!(
            self.phase == phase,
            "{event} delivered in phase {:?}, expected {phase:?}",
            self.phase
        );
    }

    /// Marks the stream dead after a decoder error; later events are
    /// dropped.
    pub fn poison(&mut self) {
        self.phase = Phase::Poisoned;
    }

    pub fn is_poisoned(&self) -> bool {
        self.phase == Phase::Poisoned
    }

    pub fn metadata(&mut self, metadata: &FileMetadata) -> Result<()> {
        if self.is_poisoned() {
            return Ok(());
        }
        self.expect(Phase::Start, "metadata");
        self.var_count = metadata.var_count;
        self.row_count = metadata.row_count;
        self.phase = Phase::Dictionary;
        let r = self.handler.on_metadata(metadata);
        self.call(r)
    }

    pub fn value_label(&mut self, set: LabelSetId, value: &Value, label: &str) -> Result<()> {
        if self.is_poisoned() {
            return Ok(());
        }
        self.expect(Phase::Dictionary, "value label");
        trace!("value label {set} {value:?} => {label:?}");
        let r = self.handler.on_value_label(set, value, label);
        self.call(r)
    }

    pub fn variable(&mut self, variable: &Variable) -> Result<()> {
        if self.is_poisoned() {
            return Ok(());
        }
        self.expect(Phase::Dictionary, "variable");
        debug_assert_eq!(variable.index, self.variables, "variable indexes must be contiguous");
        self.variables += 1;
        let r = self
            .handler
            .on_variable(variable.index, variable, variable.label_set);
        self.call(r)
    }

    /// Ends the dictionary. `offset` is where the decoder stands, reported if
    /// fewer or more variables were delivered than the metadata declared.
    pub fn finalize_variables(&mut self, offset: u64) -> Result<()> {
        if self.is_poisoned() {
            return Ok(());
        }
        self.expect(Phase::Dictionary, "finalize variables");
        if self.variables != self.var_count {
            self.phase = Phase::Poisoned;
            return Err(Error::malformed(
                offset,
                format!(
                    "{} variables declared but {} present",
                    self.var_count, self.variables
                ),
            ));
        }
        self.phase = Phase::Values;
        let r = self.handler.on_finalize_variables();
        self.call(r)
    }

    pub fn value(&mut self, var_index: usize, row_index: u64, value: Value) -> Result<()> {
        if self.is_poisoned() {
            return Ok(());
        }
        self.expect(Phase::Values, "value");
        debug_assert!(var_index < self.var_count && row_index < self.row_count);
        self.values += 1;
        let r = self.handler.on_value(var_index, row_index, value);
        self.call(r)
    }

    pub fn finalize_values(&mut self, offset: u64) -> Result<()> {
        if self.is_poisoned() {
            return Ok(());
        }
        self.expect(Phase::Values, "finalize values");
        let expected = self.row_count * self.var_count as u64;
        if self.values != expected {
            self.phase = Phase::Poisoned;
            return Err(Error::malformed(
                offset,
                format!("{expected} values declared but {} present", self.values),
            ));
        }
        self.phase = Phase::Done;
        let r = self.handler.on_finalize_values();
        self.call(r)
    }

    pub fn var_count(&self) -> usize {
        self.var_count
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }
}
