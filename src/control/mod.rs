//! Mirrored Host/Worker control sheets
//!
//! Each stage declares its tunable parameters once through a
//! [`SheetBuilder`]. Building produces two sides that mirror each other:
//!
//! - [`HostSheet`]: owned by the supervisor, the only surface a UI binds to
//! - [`WorkerSheet`]: moved into the stage's worker thread
//!
//! Every operation on a field (`enable`, `disable`, `set_config`,
//! `set_<value>`, signal `send`) updates the local side immediately and
//! queues a [`SheetMessage`] for the opposite side. The opposite side applies
//! it during its own `process_messages()` pump and fires its bound
//! `call_on_*` callbacks unless the update carried `block_event`.
//!
//! A local update never fires local callbacks, and applying a remote update
//! never sends a message back. The one exception is the worker confirming a
//! host-originated value (see [`WorkerSheet::confirm`]), which is what makes
//! concurrent edits on both sides converge.

mod field;
mod sheet;

pub use field::{
    FieldHandle, FlagField, NumberField, ProgressField, SelectionField, SignalField, TextField,
};
pub use sheet::{HostSheet, SheetRole, SheetSide, WorkerSheet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the text field every sheet carries for stage-local errors.
pub const ERROR_FIELD: &str = "error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    /// One-shot trigger without a value.
    Signal,
    Flag,
    Number,
    Text,
    /// Index into a choice list, or none.
    Selection,
    /// 0..=100, shown while a stage is busy.
    Progress,
}

impl FieldKind {
    pub fn default_value(&self) -> FieldValue {
        match self {
            FieldKind::Signal => FieldValue::Signal,
            FieldKind::Flag => FieldValue::Flag(false),
            FieldKind::Number => FieldValue::Number(0.0),
            FieldKind::Text => FieldValue::Text(String::new()),
            FieldKind::Selection => FieldValue::Selection(None),
            FieldKind::Progress => FieldValue::Progress(0),
        }
    }
}

/// Current value of a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Signal,
    Flag(bool),
    Number(f64),
    Text(String),
    Selection(Option<usize>),
    Progress(u8),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Signal => FieldKind::Signal,
            FieldValue::Flag(_) => FieldKind::Flag,
            FieldValue::Number(_) => FieldKind::Number,
            FieldValue::Text(_) => FieldKind::Text,
            FieldValue::Selection(_) => FieldKind::Selection,
            FieldValue::Progress(_) => FieldKind::Progress,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            FieldValue::Flag(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// `Some(None)` is the none choice; `None` means not a selection.
    pub fn as_selection(&self) -> Option<Option<usize>> {
        match self {
            FieldValue::Selection(v) => Some(*v),
            _ => None,
        }
    }
}

/// Editable range of a number field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberConfig {
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub decimals: u32,
}

impl NumberConfig {
    /// Bounds given in the wrong order are swapped.
    pub fn new(min: f64, max: f64, step: f64, decimals: u32) -> Self {
        let (min, max) = if min > max { (max, min) } else { (min, max) };
        Self {
            min,
            max,
            step,
            decimals,
        }
    }

    /// Integer range with step 1.
    pub fn int(min: i64, max: i64) -> Self {
        Self::new(min as f64, max as f64, 1.0, 0)
    }

    /// Clamp into `[min, max]` and round to `decimals`.
    ///
    /// Never panics, even for a config deserialized with inverted bounds.
    pub fn clamp(&self, value: f64) -> f64 {
        let (lo, hi) = if self.min > self.max {
            (self.max, self.min)
        } else {
            (self.min, self.max)
        };
        let value = if value.is_nan() { lo } else { value };
        let clamped = value.max(lo).min(hi);
        let scale = 10f64.powi(self.decimals as i32);
        (clamped * scale).round() / scale
    }
}

impl Default for NumberConfig {
    fn default() -> Self {
        Self::new(0.0, 1.0, 0.01, 2)
    }
}

/// Choice list of a selection field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectionConfig {
    pub choices: Vec<String>,
    /// Label of the "nothing selected" entry. `None` means the field has no
    /// none entry and a UI should always show a real choice.
    pub none_choice_name: Option<String>,
}

impl SelectionConfig {
    pub fn new<S: Into<String>>(choices: impl IntoIterator<Item = S>) -> Self {
        Self {
            choices: choices.into_iter().map(Into::into).collect(),
            none_choice_name: None,
        }
    }

    pub fn with_none_choice(mut self, name: impl Into<String>) -> Self {
        self.none_choice_name = Some(name.into());
        self
    }

    pub fn index_of(&self, choice: &str) -> Option<usize> {
        self.choices.iter().position(|c| c == choice)
    }
}

/// Kind-specific configuration pushed with `set_config`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum FieldConfig {
    #[default]
    None,
    Number(NumberConfig),
    Selection(SelectionConfig),
}

/// Message crossing from one sheet side to the other.
#[derive(Debug, Clone, PartialEq)]
pub enum SheetMessage {
    Enable {
        field: String,
    },
    Disable {
        field: String,
    },
    Config {
        field: String,
        config: FieldConfig,
    },
    Value {
        field: String,
        value: FieldValue,
        block_event: bool,
    },
    Signal {
        field: String,
    },
}

impl SheetMessage {
    pub fn field(&self) -> &str {
        match self {
            SheetMessage::Enable { field }
            | SheetMessage::Disable { field }
            | SheetMessage::Config { field, .. }
            | SheetMessage::Value { field, .. }
            | SheetMessage::Signal { field } => field,
        }
    }
}

/// What a remote update did to a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldEvent {
    Enabled,
    Disabled,
    Config(FieldConfig),
    Value { value: FieldValue, block_event: bool },
    Signal,
}

/// One remote update applied during `process_messages`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: String,
    pub event: FieldEvent,
}

impl FieldChange {
    /// The applied value, unless it was sent with `block_event`.
    pub fn value(&self) -> Option<&FieldValue> {
        match &self.event {
            FieldEvent::Value {
                value,
                block_event: false,
            } => Some(value),
            _ => None,
        }
    }

    pub fn is_signal(&self) -> bool {
        matches!(self.event, FieldEvent::Signal)
    }

    /// Whether a stage should react to this change.
    pub fn is_actionable(&self) -> bool {
        self.value().is_some() || self.is_signal()
    }
}

/// Control sheet errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    #[error("Unknown control field '{0}'")]
    UnknownField(String),

    #[error("Field '{field}' is a {actual:?}, not a {expected:?}")]
    KindMismatch {
        field: String,
        expected: FieldKind,
        actual: FieldKind,
    },

    #[error("Invalid choice {index} for field '{field}' ({available} choices)")]
    InvalidChoice {
        field: String,
        index: usize,
        available: usize,
    },

    #[error("Unknown choice '{choice}' for field '{field}'")]
    UnknownChoice { field: String, choice: String },

    #[error("Field '{0}' declared twice")]
    DuplicateField(String),
}

struct FieldDecl {
    name: String,
    kind: FieldKind,
    config: FieldConfig,
    enabled: bool,
}

/// Declares a stage's fields and builds the mirrored pair.
pub struct SheetBuilder {
    stage: String,
    fields: Vec<FieldDecl>,
}

impl SheetBuilder {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            fields: vec![FieldDecl {
                name: ERROR_FIELD.to_string(),
                kind: FieldKind::Text,
                config: FieldConfig::None,
                enabled: true,
            }],
        }
    }

    fn push(&mut self, name: &str, kind: FieldKind, config: FieldConfig) -> &mut Self {
        if self.fields.iter().any(|f| f.name == name) {
            tracing::warn!(
                "{}: {}",
                self.stage,
                ControlError::DuplicateField(name.to_string())
            );
            return self;
        }
        self.fields.push(FieldDecl {
            name: name.to_string(),
            kind,
            config,
            enabled: false,
        });
        self
    }

    pub fn signal(&mut self, name: &str) -> &mut Self {
        self.push(name, FieldKind::Signal, FieldConfig::None)
    }

    pub fn flag(&mut self, name: &str) -> &mut Self {
        self.push(name, FieldKind::Flag, FieldConfig::None)
    }

    pub fn number(&mut self, name: &str, config: NumberConfig) -> &mut Self {
        self.push(name, FieldKind::Number, FieldConfig::Number(config))
    }

    pub fn text(&mut self, name: &str) -> &mut Self {
        self.push(name, FieldKind::Text, FieldConfig::None)
    }

    pub fn selection(&mut self, name: &str, config: SelectionConfig) -> &mut Self {
        self.push(name, FieldKind::Selection, FieldConfig::Selection(config))
    }

    pub fn progress(&mut self, name: &str) -> &mut Self {
        self.push(name, FieldKind::Progress, FieldConfig::None)
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Build the two sides. Declared fields start disabled; `error` starts enabled.
    pub fn build(self) -> (HostSheet, WorkerSheet) {
        let (host_tx, worker_rx) = crossbeam_channel::unbounded();
        let (worker_tx, host_rx) = crossbeam_channel::unbounded();

        let specs: Vec<_> = self
            .fields
            .into_iter()
            .map(|d| (d.name, d.kind, d.config, d.enabled))
            .collect();

        let host = HostSheet::new(&self.stage, &specs, host_tx, host_rx);
        let worker = WorkerSheet::new(&self.stage, &specs, worker_tx, worker_rx);
        (host, worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_config_clamp() {
        let cfg = NumberConfig::new(0.0, 2.0, 0.1, 1);
        assert_eq!(cfg.clamp(5.0), 2.0);
        assert_eq!(cfg.clamp(-1.0), 0.0);
        assert_eq!(cfg.clamp(1.26), 1.3);
        assert_eq!(cfg.clamp(f64::NAN), 0.0);
        assert_eq!(NumberConfig::int(1, 4).clamp(2.6), 3.0);
    }

    #[test]
    fn test_number_config_inverted_bounds() {
        let cfg = NumberConfig::new(10.0, 1.0, 1.0, 0);
        assert_eq!((cfg.min, cfg.max), (1.0, 10.0));
        assert_eq!(cfg.clamp(20.0), 10.0);

        let raw = NumberConfig {
            min: 5.0,
            max: -5.0,
            step: 1.0,
            decimals: 0,
        };
        assert_eq!(raw.clamp(9.0), 5.0);
        assert_eq!(raw.clamp(-9.0), -5.0);
        assert_eq!(raw.clamp(f64::NAN), -5.0);
    }

    #[test]
    fn test_selection_config() {
        let cfg = SelectionConfig::new(["a", "b"]).with_none_choice("@misc.no_model");
        assert_eq!(cfg.index_of("b"), Some(1));
        assert_eq!(cfg.index_of("c"), None);
        assert_eq!(cfg.none_choice_name.as_deref(), Some("@misc.no_model"));
    }

    #[test]
    fn test_field_change_actionable() {
        let blocked = FieldChange {
            field: "x".into(),
            event: FieldEvent::Value {
                value: FieldValue::Number(1.0),
                block_event: true,
            },
        };
        assert!(!blocked.is_actionable());
        let signal = FieldChange {
            field: "reset".into(),
            event: FieldEvent::Signal,
        };
        assert!(signal.is_actionable());
    }

    #[test]
    fn test_builder_ignores_duplicates() {
        let mut b = SheetBuilder::new("stage");
        b.flag("on").flag("on").number("n", NumberConfig::default());
        let (host, _worker) = b.build();
        assert_eq!(host.field_names(), vec!["error", "on", "n"]);
    }
}
