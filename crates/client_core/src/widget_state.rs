//! Authoritative store of widget values and the form batching rules that
//! decide when a user edit travels to the host.
//!
//! Every rendered control reads its value from here; none keeps a private
//! copy. Host writes land unconditionally and never echo back. User writes on
//! free-standing widgets are sent before `set_value` returns, while user writes
//! on form members stay local until the form is submitted.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use shared::{
    domain::{FormId, WidgetId},
    protocol::{ClientMessage, ScriptFinishStatus},
    widget::{WidgetDeclaration, WidgetState, WidgetValue},
};
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, Diagnostic, WidgetStateError};

/// Destination of outbound client messages. Delivery is enqueue-only: it
/// either accepts the message before returning or reports why it could not.
pub trait Outbox: Send + Sync {
    fn deliver(&self, message: ClientMessage) -> Result<(), ConnectionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    /// Default or current value sent by the host while rendering.
    Host,
    /// User interaction.
    Ui,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Host write; nothing leaves the client.
    Stored,
    /// Free-standing edit handed to the outbox.
    Sent,
    /// Form member edit held until the form is submitted.
    Buffered,
    /// Free-standing edit the outbox refused; kept dirty for `flush_dirty`.
    Deferred,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WidgetRecord {
    pub id: WidgetId,
    pub value: WidgetValue,
    pub default: WidgetValue,
    pub form_id: Option<FormId>,
    /// Changed by the user and not yet delivered to the host.
    pub dirty: bool,
}

impl WidgetRecord {
    fn state(&self) -> WidgetState {
        WidgetState {
            widget_id: self.id.clone(),
            value: self.value.clone(),
        }
    }

    fn settle_after_send(&mut self) {
        self.dirty = false;
        if let Some(idle) = self.value.trigger_idle() {
            self.value = idle;
        }
    }
}

pub type FormClearedCallback = Box<dyn FnMut(&FormId) + Send>;

pub struct FormRecord {
    pub form_id: FormId,
    pub clear_on_submit: bool,
    pub has_submit_button: bool,
    pending_listeners: HashMap<String, FormClearedCallback>,
}

impl FormRecord {
    fn new(form_id: FormId) -> Self {
        Self {
            form_id,
            clear_on_submit: false,
            has_submit_button: false,
            pending_listeners: HashMap::new(),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.pending_listeners.len()
    }
}

impl fmt::Debug for FormRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormRecord")
            .field("form_id", &self.form_id)
            .field("clear_on_submit", &self.clear_on_submit)
            .field("has_submit_button", &self.has_submit_button)
            .field("listeners", &self.pending_listeners.len())
            .finish()
    }
}

/// Registration of one control's form-cleared callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormClearedSubscription {
    owner: String,
    form_id: FormId,
}

impl FormClearedSubscription {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn form_id(&self) -> &FormId {
        &self.form_id
    }
}

pub struct WidgetStateStore {
    outbox: Arc<dyn Outbox>,
    widgets: HashMap<WidgetId, WidgetRecord>,
    forms: HashMap<FormId, FormRecord>,
    listener_forms: HashMap<String, FormId>,
    active_widgets: HashSet<WidgetId>,
    active_forms: HashSet<FormId>,
}

impl WidgetStateStore {
    pub fn new(outbox: Arc<dyn Outbox>) -> Self {
        Self {
            outbox,
            widgets: HashMap::new(),
            forms: HashMap::new(),
            listener_forms: HashMap::new(),
            active_widgets: HashSet::new(),
            active_forms: HashSet::new(),
        }
    }

    pub fn get_value(&self, widget_id: &WidgetId) -> Option<&WidgetValue> {
        self.widgets.get(widget_id).map(|record| &record.value)
    }

    pub fn record(&self, widget_id: &WidgetId) -> Option<&WidgetRecord> {
        self.widgets.get(widget_id)
    }

    pub fn form(&self, form_id: &FormId) -> Option<&FormRecord> {
        self.forms.get(form_id)
    }

    pub fn len(&self) -> usize {
        self.widgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widgets.is_empty()
    }

    pub fn is_dirty(&self, widget_id: &WidgetId) -> bool {
        self.widgets
            .get(widget_id)
            .is_some_and(|record| record.dirty)
    }

    pub fn forms_with_pending_changes(&self) -> Vec<FormId> {
        let mut forms: Vec<FormId> = self
            .widgets
            .values()
            .filter(|record| record.dirty)
            .filter_map(|record| record.form_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        forms.sort();
        forms
    }

    /// Host declaration of a widget for the current script run. Replaces any
    /// earlier record under the same id, including its kind.
    pub fn declare_widget(
        &mut self,
        declaration: WidgetDeclaration,
    ) -> Result<(), WidgetStateError> {
        let WidgetDeclaration {
            widget_id,
            default,
            value,
            form_id,
        } = declaration;

        default
            .validate()
            .map_err(|reason| WidgetStateError::InvalidValue {
                widget_id: widget_id.clone(),
                reason,
            })?;
        let value = match value {
            Some(value) => {
                if value.kind() != default.kind() {
                    return Err(WidgetStateError::KindMismatch {
                        widget_id,
                        expected: default.kind(),
                        actual: value.kind(),
                    });
                }
                value
                    .validate()
                    .map_err(|reason| WidgetStateError::InvalidValue {
                        widget_id: widget_id.clone(),
                        reason,
                    })?;
                value
            }
            None => default.clone(),
        };

        if let Some(form_id) = &form_id {
            self.ensure_form(form_id);
            self.active_forms.insert(form_id.clone());
        }
        self.active_widgets.insert(widget_id.clone());
        self.widgets.insert(
            widget_id.clone(),
            WidgetRecord {
                id: widget_id,
                value,
                default,
                form_id,
                dirty: false,
            },
        );
        Ok(())
    }

    pub fn declare_form(&mut self, form_id: &FormId, clear_on_submit: bool, has_submit_button: bool) {
        let form = self.ensure_form(form_id);
        form.clear_on_submit = clear_on_submit;
        form.has_submit_button = has_submit_button;
        self.active_forms.insert(form_id.clone());
    }

    /// Writes `value` into the widget's record.
    ///
    /// Host writes are stored as-is. A user write on a form member is buffered;
    /// on a free-standing widget it is delivered to the host before this
    /// returns. Values of the wrong kind or failing their kind's validity check
    /// are rejected and the previous value is kept.
    pub fn set_value(
        &mut self,
        widget_id: &WidgetId,
        value: WidgetValue,
        source: ValueSource,
        form_id: Option<&FormId>,
    ) -> Result<Delivery, WidgetStateError> {
        let result = self.write_value(widget_id, value, source, form_id);
        if let Err(err) = &result {
            warn!(widget_id = %widget_id, ?source, "widgets: rejected value: {err}");
        }
        result
    }

    fn write_value(
        &mut self,
        widget_id: &WidgetId,
        value: WidgetValue,
        source: ValueSource,
        form_id: Option<&FormId>,
    ) -> Result<Delivery, WidgetStateError> {
        value
            .validate()
            .map_err(|reason| WidgetStateError::InvalidValue {
                widget_id: widget_id.clone(),
                reason,
            })?;

        if let Some(form_id) = form_id {
            self.ensure_form(form_id);
        }

        if !self.widgets.contains_key(widget_id) && source == ValueSource::Host {
            self.widgets.insert(
                widget_id.clone(),
                WidgetRecord {
                    id: widget_id.clone(),
                    value: value.clone(),
                    default: value.clone(),
                    form_id: form_id.cloned(),
                    dirty: false,
                },
            );
        }
        let Some(record) = self.widgets.get_mut(widget_id) else {
            return Err(WidgetStateError::UnknownWidget(widget_id.clone()));
        };

        if record.value.kind() != value.kind() {
            return Err(WidgetStateError::KindMismatch {
                widget_id: widget_id.clone(),
                expected: record.value.kind(),
                actual: value.kind(),
            });
        }
        if let Some(form_id) = form_id {
            record.form_id = Some(form_id.clone());
        }
        record.value = value;

        match source {
            ValueSource::Host => {
                record.dirty = false;
                Ok(Delivery::Stored)
            }
            ValueSource::Ui => {
                record.dirty = true;
                if let Some(form_id) = &record.form_id {
                    debug!(widget_id = %widget_id, form_id = %form_id, "widgets: buffered form edit");
                    return Ok(Delivery::Buffered);
                }
                Ok(self.send_free_standing(widget_id))
            }
        }
    }

    fn send_free_standing(&mut self, widget_id: &WidgetId) -> Delivery {
        let Some(record) = self.widgets.get_mut(widget_id) else {
            return Delivery::Deferred;
        };
        let message = ClientMessage::WidgetStatesChanged {
            widgets: vec![record.state()],
        };
        match self.outbox.deliver(message) {
            Ok(()) => {
                record.settle_after_send();
                Delivery::Sent
            }
            Err(err) => {
                warn!(widget_id = %widget_id, "widgets: keeping edit for later delivery: {err}");
                Delivery::Deferred
            }
        }
    }

    /// Sends every member of `form_id` in one batch, then clears the form when
    /// it is configured to. Returns the number of widgets sent.
    pub fn submit_form(&mut self, form_id: &FormId) -> Result<usize, WidgetStateError> {
        let Some(form) = self.forms.get_mut(form_id) else {
            return Err(WidgetStateError::UnknownForm(form_id.clone()));
        };

        let mut members: Vec<&mut WidgetRecord> = self
            .widgets
            .values_mut()
            .filter(|record| record.form_id.as_ref() == Some(form_id))
            .collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));

        let message = ClientMessage::FormSubmitted {
            form_id: form_id.clone(),
            widgets: members.iter().map(|record| record.state()).collect(),
        };
        self.outbox
            .deliver(message)
            .map_err(|source| WidgetStateError::SubmitFailed {
                form_id: form_id.clone(),
                source,
            })?;

        let sent = members.len();
        for record in members {
            record.settle_after_send();
            if form.clear_on_submit {
                record.value = record.default.clone();
            }
        }
        info!(form_id = %form_id, widgets = sent, "widgets: form submitted");

        if form.clear_on_submit {
            let cleared = form.form_id.clone();
            for callback in form.pending_listeners.values_mut() {
                callback(&cleared);
            }
        }
        Ok(sent)
    }

    /// Registers `callback` to run whenever `form_id` is cleared on submit.
    ///
    /// `owner` identifies the control instance; registering again under the
    /// same owner replaces its previous subscription, whichever form it was
    /// for. Callbacks run while the store is borrowed and must not call back
    /// into it.
    pub fn add_form_cleared_listener(
        &mut self,
        form_id: &FormId,
        owner: impl Into<String>,
        callback: impl FnMut(&FormId) + Send + 'static,
    ) -> FormClearedSubscription {
        let owner = owner.into();
        if let Some(previous) = self.listener_forms.remove(&owner) {
            if let Some(form) = self.forms.get_mut(&previous) {
                form.pending_listeners.remove(&owner);
            }
        }

        self.ensure_form(form_id)
            .pending_listeners
            .insert(owner.clone(), Box::new(callback));
        self.listener_forms.insert(owner.clone(), form_id.clone());

        FormClearedSubscription {
            owner,
            form_id: form_id.clone(),
        }
    }

    pub fn remove_form_cleared_listener(&mut self, subscription: &FormClearedSubscription) -> bool {
        if self.listener_forms.get(&subscription.owner) != Some(&subscription.form_id) {
            return false;
        }
        self.listener_forms.remove(&subscription.owner);
        self.forms
            .get_mut(&subscription.form_id)
            .is_some_and(|form| form.pending_listeners.remove(&subscription.owner).is_some())
    }

    /// Re-sends free-standing edits the outbox refused earlier. Form edits stay
    /// buffered until their form is submitted.
    pub fn flush_dirty(&mut self) -> usize {
        let mut pending: Vec<WidgetId> = self
            .widgets
            .values()
            .filter(|record| record.dirty && record.form_id.is_none())
            .map(|record| record.id.clone())
            .collect();
        if pending.is_empty() {
            return 0;
        }
        pending.sort();

        let widgets = pending
            .iter()
            .filter_map(|id| self.widgets.get(id).map(WidgetRecord::state))
            .collect();
        if let Err(err) = self
            .outbox
            .deliver(ClientMessage::WidgetStatesChanged { widgets })
        {
            warn!(count = pending.len(), "widgets: deferred edits still undeliverable: {err}");
            return 0;
        }

        for id in &pending {
            if let Some(record) = self.widgets.get_mut(id) {
                record.settle_after_send();
            }
        }
        info!(count = pending.len(), "widgets: flushed deferred edits");
        pending.len()
    }

    pub fn begin_script_run(&mut self) {
        self.active_widgets.clear();
        self.active_forms.clear();
    }

    /// Closes the current script run. A successful run drops widgets it did not
    /// declare and reports forms left without a submit button.
    pub fn end_script_run(&mut self, status: ScriptFinishStatus) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();

        if status == ScriptFinishStatus::Success {
            let before = self.widgets.len();
            let active = &self.active_widgets;
            self.widgets.retain(|id, _| active.contains(id));
            let removed = before - self.widgets.len();
            if removed > 0 {
                debug!(removed, "widgets: dropped widgets absent from the last run");
            }

            let mut missing: Vec<&FormId> = self
                .active_forms
                .iter()
                .filter(|form_id| {
                    self.forms
                        .get(*form_id)
                        .is_some_and(|form| !form.has_submit_button)
                })
                .collect();
            missing.sort();
            for form_id in missing {
                warn!(form_id = %form_id, "widgets: form has no submit button");
                diagnostics.push(Diagnostic::MissingSubmitButton {
                    form_id: form_id.clone(),
                });
            }
        }

        self.begin_script_run();
        diagnostics
    }

    /// A new host session starts: form records and their listeners are dropped.
    pub fn begin_session(&mut self) {
        self.forms.clear();
        self.listener_forms.clear();
        self.active_widgets.clear();
        self.active_forms.clear();
    }

    /// Puts every widget back to its host default, discarding unsent edits.
    pub fn resync_from_defaults(&mut self) {
        for record in self.widgets.values_mut() {
            record.value = record.default.clone();
            record.dirty = false;
        }
        info!(widgets = self.widgets.len(), "widgets: resynced to host defaults");
    }

    fn ensure_form(&mut self, form_id: &FormId) -> &mut FormRecord {
        self.forms
            .entry(form_id.clone())
            .or_insert_with(|| FormRecord::new(form_id.clone()))
    }
}

#[cfg(test)]
#[path = "tests/widget_state_tests.rs"]
mod tests;
