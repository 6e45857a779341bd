//! Field storage and typed field handles.

use super::{
    ControlError, FieldConfig, FieldEvent, FieldKind, FieldValue, NumberConfig, SelectionConfig,
    SheetMessage,
};
use crossbeam_channel::Sender;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

type Listener = Box<dyn FnMut(&FieldEvent) + Send>;

struct FieldState {
    kind: FieldKind,
    enabled: bool,
    value: FieldValue,
    config: FieldConfig,
    listeners: Vec<Listener>,
}

pub(crate) struct FieldShared {
    name: String,
    state: Mutex<FieldState>,
    outbox: Sender<SheetMessage>,
}

impl FieldShared {
    pub(crate) fn new(
        name: &str,
        kind: FieldKind,
        config: FieldConfig,
        enabled: bool,
        outbox: Sender<SheetMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(FieldState {
                kind,
                enabled,
                value: kind.default_value(),
                config,
                listeners: Vec::new(),
            }),
            outbox,
        })
    }

    fn lock(&self) -> MutexGuard<'_, FieldState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send(&self, msg: SheetMessage) {
        if self.outbox.send(msg).is_err() {
            tracing::trace!("Field '{}': opposite sheet side is gone", self.name);
        }
    }

    /// Apply an update from the opposite side. Never sends anything back.
    pub(crate) fn apply_remote(&self, msg: SheetMessage) -> Option<FieldEvent> {
        let event = {
            let mut state = self.lock();
            match msg {
                SheetMessage::Enable { .. } => {
                    state.enabled = true;
                    FieldEvent::Enabled
                }
                SheetMessage::Disable { .. } => {
                    state.enabled = false;
                    FieldEvent::Disabled
                }
                SheetMessage::Config { config, .. } => {
                    state.config = config.clone();
                    FieldEvent::Config(config)
                }
                SheetMessage::Value {
                    value, block_event, ..
                } => {
                    if value.kind() != state.kind {
                        tracing::warn!(
                            "Field '{}' dropped {:?} value (field is {:?})",
                            self.name,
                            value.kind(),
                            state.kind
                        );
                        return None;
                    }
                    state.value = value.clone();
                    FieldEvent::Value { value, block_event }
                }
                SheetMessage::Signal { .. } => FieldEvent::Signal,
            }
        };

        let blocked = matches!(
            event,
            FieldEvent::Value {
                block_event: true,
                ..
            }
        );
        if !blocked {
            self.fire(&event);
        }
        Some(event)
    }

    fn fire(&self, event: &FieldEvent) {
        // Callbacks run without the lock so they may touch this field.
        let mut listeners = std::mem::take(&mut self.lock().listeners);
        for listener in listeners.iter_mut() {
            listener(event);
        }
        let mut state = self.lock();
        listeners.append(&mut state.listeners);
        state.listeners = listeners;
    }
}

/// Untyped handle to one side of a field.
#[derive(Clone)]
pub struct FieldHandle {
    shared: Arc<FieldShared>,
}

impl FieldHandle {
    pub(crate) fn new(shared: Arc<FieldShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<FieldShared> {
        &self.shared
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn kind(&self) -> FieldKind {
        self.shared.lock().kind
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.lock().enabled
    }

    pub fn enable(&self) {
        self.shared.lock().enabled = true;
        self.shared.send(SheetMessage::Enable {
            field: self.shared.name.clone(),
        });
    }

    pub fn disable(&self) {
        self.shared.lock().enabled = false;
        self.shared.send(SheetMessage::Disable {
            field: self.shared.name.clone(),
        });
    }

    pub fn config(&self) -> FieldConfig {
        self.shared.lock().config.clone()
    }

    pub fn set_field_config(&self, config: FieldConfig) {
        self.shared.lock().config = config.clone();
        self.shared.send(SheetMessage::Config {
            field: self.shared.name.clone(),
            config,
        });
    }

    pub fn value(&self) -> FieldValue {
        self.shared.lock().value.clone()
    }

    /// Set the local value and push it to the opposite side.
    pub fn set_value(&self, value: FieldValue, block_event: bool) -> Result<(), ControlError> {
        {
            let mut state = self.shared.lock();
            if value.kind() != state.kind {
                return Err(ControlError::KindMismatch {
                    field: self.shared.name.clone(),
                    expected: state.kind,
                    actual: value.kind(),
                });
            }
            state.value = value.clone();
        }
        self.shared.send(SheetMessage::Value {
            field: self.shared.name.clone(),
            value,
            block_event,
        });
        Ok(())
    }

    /// Bind a callback fired when the opposite side updates this field.
    pub fn call_on_event<F>(&self, callback: F)
    where
        F: FnMut(&FieldEvent) + Send + 'static,
    {
        self.shared.lock().listeners.push(Box::new(callback));
    }

    fn lock_value<R>(&self, f: impl FnOnce(&FieldValue) -> R) -> R {
        f(&self.shared.lock().value)
    }
}

impl std::fmt::Debug for FieldHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Field")
            .field("name", &self.shared.name)
            .field("kind", &state.kind)
            .field("enabled", &state.enabled)
            .field("value", &state.value)
            .finish()
    }
}

macro_rules! typed_field {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug)]
        pub struct $name(FieldHandle);

        impl $name {
            pub(crate) fn wrap(handle: FieldHandle) -> Self {
                Self(handle)
            }
        }

        impl Deref for $name {
            type Target = FieldHandle;

            fn deref(&self) -> &FieldHandle {
                &self.0
            }
        }
    };
}

typed_field!(
    /// Number with a min/max/step/decimals range.
    NumberField
);
typed_field!(FlagField);
typed_field!(TextField);
typed_field!(
    /// Index into a choice list, with an optional none choice.
    SelectionField
);
typed_field!(
    /// One-shot trigger.
    SignalField
);
typed_field!(ProgressField);

impl NumberField {
    pub fn get_number(&self) -> f64 {
        self.lock_value(|v| v.as_number().unwrap_or_default())
    }

    pub fn set_number(&self, value: f64, block_event: bool) {
        // Kind is fixed at construction.
        let _ = self.set_value(FieldValue::Number(value), block_event);
    }

    pub fn number_config(&self) -> NumberConfig {
        match self.config() {
            FieldConfig::Number(cfg) => cfg,
            _ => NumberConfig::default(),
        }
    }

    pub fn set_config(&self, config: NumberConfig) {
        self.set_field_config(FieldConfig::Number(config));
    }

    /// Clamp `value` into the current range.
    pub fn clamp(&self, value: f64) -> f64 {
        self.number_config().clamp(value)
    }

    pub fn call_on_number<F>(&self, mut callback: F)
    where
        F: FnMut(f64) + Send + 'static,
    {
        self.call_on_event(move |event| {
            if let FieldEvent::Value {
                value: FieldValue::Number(v),
                ..
            } = event
            {
                callback(*v);
            }
        });
    }
}

impl FlagField {
    pub fn get_flag(&self) -> bool {
        self.lock_value(|v| v.as_flag().unwrap_or_default())
    }

    pub fn set_flag(&self, value: bool, block_event: bool) {
        let _ = self.set_value(FieldValue::Flag(value), block_event);
    }

    pub fn call_on_flag<F>(&self, mut callback: F)
    where
        F: FnMut(bool) + Send + 'static,
    {
        self.call_on_event(move |event| {
            if let FieldEvent::Value {
                value: FieldValue::Flag(v),
                ..
            } = event
            {
                callback(*v);
            }
        });
    }
}

impl TextField {
    pub fn get_text(&self) -> String {
        self.lock_value(|v| v.as_text().unwrap_or_default().to_string())
    }

    pub fn set_text(&self, value: impl Into<String>, block_event: bool) {
        let _ = self.set_value(FieldValue::Text(value.into()), block_event);
    }

    pub fn call_on_text<F>(&self, mut callback: F)
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.call_on_event(move |event| {
            if let FieldEvent::Value {
                value: FieldValue::Text(v),
                ..
            } = event
            {
                callback(v);
            }
        });
    }
}

impl SelectionField {
    pub fn selection_config(&self) -> SelectionConfig {
        match self.config() {
            FieldConfig::Selection(cfg) => cfg,
            _ => SelectionConfig::default(),
        }
    }

    pub fn get_choices(&self) -> Vec<String> {
        self.selection_config().choices
    }

    /// Replace the choice list.
    pub fn set_choices<S: Into<String>>(
        &self,
        choices: impl IntoIterator<Item = S>,
        none_choice_name: Option<&str>,
    ) {
        let mut cfg = SelectionConfig::new(choices);
        cfg.none_choice_name = none_choice_name.map(str::to_string);
        self.set_field_config(FieldConfig::Selection(cfg));
    }

    /// `None` is the none choice.
    pub fn get_selected_index(&self) -> Option<usize> {
        self.lock_value(|v| v.as_selection().flatten())
    }

    pub fn get_selected_choice(&self) -> Option<String> {
        let idx = self.get_selected_index()?;
        self.get_choices().get(idx).cloned()
    }

    pub fn set_selected_index(
        &self,
        index: Option<usize>,
        block_event: bool,
    ) -> Result<(), ControlError> {
        if let Some(idx) = index {
            let available = self.get_choices().len();
            if idx >= available {
                return Err(ControlError::InvalidChoice {
                    field: self.name().to_string(),
                    index: idx,
                    available,
                });
            }
        }
        self.set_value(FieldValue::Selection(index), block_event)
    }

    pub fn set_selected_choice(&self, choice: &str, block_event: bool) -> Result<(), ControlError> {
        let idx = self
            .selection_config()
            .index_of(choice)
            .ok_or_else(|| ControlError::UnknownChoice {
                field: self.name().to_string(),
                choice: choice.to_string(),
            })?;
        self.set_selected_index(Some(idx), block_event)
    }

    pub fn call_on_selected_index<F>(&self, mut callback: F)
    where
        F: FnMut(Option<usize>) + Send + 'static,
    {
        self.call_on_event(move |event| {
            if let FieldEvent::Value {
                value: FieldValue::Selection(v),
                ..
            } = event
            {
                callback(*v);
            }
        });
    }
}

impl SignalField {
    pub fn send(&self) {
        self.shared().send(SheetMessage::Signal {
            field: self.name().to_string(),
        });
    }

    pub fn call_on_signal<F>(&self, mut callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.call_on_event(move |event| {
            if matches!(event, FieldEvent::Signal) {
                callback();
            }
        });
    }
}

impl ProgressField {
    pub fn get_progress(&self) -> u8 {
        self.lock_value(|v| match v {
            FieldValue::Progress(p) => *p,
            _ => 0,
        })
    }

    pub fn set_progress(&self, value: u8, block_event: bool) {
        let _ = self.set_value(FieldValue::Progress(value.min(100)), block_event);
    }
}
