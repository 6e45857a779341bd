//! The two sides of a control sheet.

use super::field::{FieldHandle, FieldShared};
use super::{
    ControlError, FieldChange, FieldConfig, FieldEvent, FieldKind, FieldValue, FlagField,
    NumberField, ProgressField, SelectionField, SheetMessage, SignalField, TextField, ERROR_FIELD,
};
use crossbeam_channel::{Receiver, Sender};
use std::ops::Deref;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetRole {
    Host,
    Worker,
}

/// Shared implementation of both sides.
pub struct SheetSide {
    stage: String,
    role: SheetRole,
    fields: Vec<FieldHandle>,
    inbox: Receiver<SheetMessage>,
}

impl SheetSide {
    fn new(
        stage: &str,
        role: SheetRole,
        specs: &[(String, FieldKind, FieldConfig, bool)],
        outbox: Sender<SheetMessage>,
        inbox: Receiver<SheetMessage>,
    ) -> Self {
        let fields = specs
            .iter()
            .map(|(name, kind, config, enabled)| {
                FieldHandle::new(FieldShared::new(
                    name,
                    *kind,
                    config.clone(),
                    *enabled,
                    outbox.clone(),
                ))
            })
            .collect();
        Self {
            stage: stage.to_string(),
            role,
            fields,
            inbox,
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn role(&self) -> SheetRole {
        self.role
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(FieldHandle::name).collect()
    }

    pub fn fields(&self) -> &[FieldHandle] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Result<FieldHandle, ControlError> {
        self.fields
            .iter()
            .find(|f| f.name() == name)
            .cloned()
            .ok_or_else(|| ControlError::UnknownField(name.to_string()))
    }

    fn typed(&self, name: &str, expected: FieldKind) -> Result<FieldHandle, ControlError> {
        let field = self.field(name)?;
        let actual = field.kind();
        if actual != expected {
            return Err(ControlError::KindMismatch {
                field: name.to_string(),
                expected,
                actual,
            });
        }
        Ok(field)
    }

    pub fn number(&self, name: &str) -> Result<NumberField, ControlError> {
        self.typed(name, FieldKind::Number).map(NumberField::wrap)
    }

    pub fn flag(&self, name: &str) -> Result<FlagField, ControlError> {
        self.typed(name, FieldKind::Flag).map(FlagField::wrap)
    }

    pub fn text(&self, name: &str) -> Result<TextField, ControlError> {
        self.typed(name, FieldKind::Text).map(TextField::wrap)
    }

    pub fn selection(&self, name: &str) -> Result<SelectionField, ControlError> {
        self.typed(name, FieldKind::Selection)
            .map(SelectionField::wrap)
    }

    pub fn signal(&self, name: &str) -> Result<SignalField, ControlError> {
        self.typed(name, FieldKind::Signal).map(SignalField::wrap)
    }

    pub fn progress(&self, name: &str) -> Result<ProgressField, ControlError> {
        self.typed(name, FieldKind::Progress)
            .map(ProgressField::wrap)
    }

    /// The built-in stage error field.
    pub fn error_field(&self) -> TextField {
        // Always declared first by the builder.
        TextField::wrap(self.fields[0].clone())
    }

    /// Apply every update queued by the opposite side, in order.
    pub fn process_messages(&self) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        for msg in self.inbox.try_iter() {
            let name = msg.field().to_string();
            let Some(field) = self.fields.iter().find(|f| f.name() == name) else {
                tracing::warn!(
                    "{} {:?} sheet: {}",
                    self.stage,
                    self.role,
                    ControlError::UnknownField(name)
                );
                continue;
            };
            if let Some(event) = field.shared().apply_remote(msg) {
                changes.push(FieldChange { field: name, event });
            }
        }
        changes
    }
}

impl std::fmt::Debug for SheetSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SheetSide")
            .field("stage", &self.stage)
            .field("role", &self.role)
            .field("fields", &self.fields)
            .finish()
    }
}

/// UI-facing side, owned by the stage host.
#[derive(Debug)]
pub struct HostSheet {
    side: SheetSide,
}

impl HostSheet {
    pub(super) fn new(
        stage: &str,
        specs: &[(String, FieldKind, FieldConfig, bool)],
        outbox: Sender<SheetMessage>,
        inbox: Receiver<SheetMessage>,
    ) -> Self {
        Self {
            side: SheetSide::new(stage, SheetRole::Host, specs, outbox, inbox),
        }
    }

    /// Current stage error text, if any.
    pub fn error(&self) -> Option<String> {
        let text = self.error_field().get_text();
        (!text.is_empty()).then_some(text)
    }
}

impl Deref for HostSheet {
    type Target = SheetSide;

    fn deref(&self) -> &SheetSide {
        &self.side
    }
}

/// Processing-facing side, moved into the worker thread.
#[derive(Debug)]
pub struct WorkerSheet {
    side: SheetSide,
}

impl WorkerSheet {
    pub(super) fn new(
        stage: &str,
        specs: &[(String, FieldKind, FieldConfig, bool)],
        outbox: Sender<SheetMessage>,
        inbox: Receiver<SheetMessage>,
    ) -> Self {
        Self {
            side: SheetSide::new(stage, SheetRole::Worker, specs, outbox, inbox),
        }
    }

    /// Acknowledge a host-originated value after the stage handled it.
    ///
    /// If the stage kept the received value, the host gets a silent echo.
    /// If the stage corrected it, its own setter already pushed the
    /// correction and nothing more is sent.
    pub fn confirm(&self, change: &FieldChange) {
        let FieldEvent::Value {
            value: received,
            block_event: false,
        } = &change.event
        else {
            return;
        };
        let Ok(field) = self.field(&change.field) else {
            return;
        };
        let current: FieldValue = field.value();
        if &current == received {
            let _ = field.set_value(current, true);
        }
    }

    /// Enable every declared field (not `error`).
    pub fn enable_all(&self) {
        for field in self.fields().iter().skip(1) {
            field.enable();
        }
    }

    /// Disable every declared field (not `error`).
    pub fn disable_all(&self) {
        for field in self.fields().iter().skip(1) {
            field.disable();
        }
    }
}

impl Deref for WorkerSheet {
    type Target = SheetSide;

    fn deref(&self) -> &SheetSide {
        &self.side
    }
}

#[cfg(test)]
mod tests {
    use super::super::{NumberConfig, SelectionConfig, SheetBuilder};
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn sheets() -> (HostSheet, WorkerSheet) {
        let mut b = SheetBuilder::new("test_stage");
        b.number("threshold", NumberConfig::new(0.0, 1.0, 0.05, 2))
            .flag("enabled")
            .selection(
                "model",
                SelectionConfig::new(["a", "b"]).with_none_choice("none"),
            )
            .signal("reset")
            .progress("load");
        b.build()
    }

    #[test]
    fn test_host_value_reaches_worker_and_fires_callback() {
        let (host, worker) = sheets();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        worker
            .number("threshold")
            .unwrap()
            .call_on_number(move |v| seen_cb.lock().unwrap().push(v));

        host.number("threshold").unwrap().set_number(0.4, false);
        assert_eq!(worker.number("threshold").unwrap().get_number(), 0.0);

        let changes = worker.process_messages();
        assert_eq!(changes.len(), 1);
        assert_eq!(worker.number("threshold").unwrap().get_number(), 0.4);
        assert_eq!(*seen.lock().unwrap(), vec![0.4]);
    }

    #[test]
    fn test_local_setter_does_not_fire_local_callback() {
        let (host, worker) = sheets();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        host.flag("enabled")
            .unwrap()
            .call_on_flag(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        host.flag("enabled").unwrap().set_flag(true, false);
        host.process_messages();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        drop(worker);
    }

    #[test]
    fn test_block_event_updates_without_callback() {
        let (host, worker) = sheets();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        host.number("threshold").unwrap().call_on_number(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        worker.number("threshold").unwrap().set_number(0.7, true);
        let changes = host.process_messages();
        assert_eq!(host.number("threshold").unwrap().get_number(), 0.7);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!changes[0].is_actionable());
    }

    #[test]
    fn test_enable_and_config_mirror() {
        let (host, worker) = sheets();
        let threshold = worker.number("threshold").unwrap();
        assert!(!host.number("threshold").unwrap().is_enabled());
        threshold.enable();
        threshold.set_config(NumberConfig::new(0.0, 0.5, 0.05, 2));
        host.process_messages();
        let mirrored = host.number("threshold").unwrap();
        assert!(mirrored.is_enabled());
        assert_eq!(mirrored.number_config().max, 0.5);

        worker.disable_all();
        host.process_messages();
        assert!(!mirrored.is_enabled());
        assert!(host.error_field().is_enabled());
    }

    #[test]
    fn test_confirm_echo_and_correction() {
        let (host, worker) = sheets();
        let host_field = host.number("threshold").unwrap();
        let worker_field = worker.number("threshold").unwrap();
        let host_events = Arc::new(AtomicUsize::new(0));
        let e = host_events.clone();
        host_field.call_on_number(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        // Accepted as-is: silent echo.
        host_field.set_number(0.3, false);
        for change in worker.process_messages() {
            worker.confirm(&change);
        }
        host.process_messages();
        assert_eq!(host_field.get_number(), 0.3);
        assert_eq!(host_events.load(Ordering::SeqCst), 0);

        // Corrected by the worker: host is told.
        host_field.set_number(3.0, false);
        for change in worker.process_messages() {
            let clamped = worker_field.clamp(change.value().and_then(|v| v.as_number()).unwrap());
            worker_field.set_number(clamped, false);
            worker.confirm(&change);
        }
        host.process_messages();
        assert_eq!(host_field.get_number(), 1.0);
        assert_eq!(host_events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let (host, worker) = sheets();
        let h = host.number("threshold").unwrap();
        let w = worker.number("threshold").unwrap();

        h.set_number(0.2, false);
        w.set_number(0.9, false);

        for change in worker.process_messages() {
            worker.confirm(&change);
        }
        host.process_messages();
        assert_eq!(h.get_number(), w.get_number());
    }

    #[test]
    fn test_selection_none_choice_and_validation() {
        let (host, worker) = sheets();
        let model = host.selection("model").unwrap();
        assert_eq!(model.get_selected_index(), None);
        assert!(matches!(
            model.set_selected_index(Some(5), false),
            Err(ControlError::InvalidChoice { .. })
        ));
        model.set_selected_choice("b", false).unwrap();
        worker.process_messages();
        let wmodel = worker.selection("model").unwrap();
        assert_eq!(wmodel.get_selected_choice().as_deref(), Some("b"));

        model.set_selected_index(None, false).unwrap();
        worker.process_messages();
        assert_eq!(wmodel.get_selected_index(), None);
        assert_eq!(
            wmodel.selection_config().none_choice_name.as_deref(),
            Some("none")
        );
    }

    #[test]
    fn test_signal_and_lookup_errors() {
        let (host, worker) = sheets();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        worker.signal("reset").unwrap().call_on_signal(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        host.signal("reset").unwrap().send();
        let changes = worker.process_messages();
        assert!(changes[0].is_signal());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        assert!(matches!(
            host.number("missing"),
            Err(ControlError::UnknownField(_))
        ));
        assert!(matches!(
            host.flag("threshold"),
            Err(ControlError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_error_field_and_progress() {
        let (host, worker) = sheets();
        assert_eq!(host.error(), None);
        worker.error_field().set_text("model missing", false);
        worker.progress("load").unwrap().set_progress(150, false);
        host.process_messages();
        assert_eq!(host.error().as_deref(), Some("model missing"));
        assert_eq!(host.progress("load").unwrap().get_progress(), 100);
    }
}
