use super::*;

use std::sync::Mutex;

use shared::widget::WidgetKind;

use crate::test_support::RecordingOutbox;

fn store() -> (WidgetStateStore, Arc<RecordingOutbox>) {
    let outbox = Arc::new(RecordingOutbox::default());
    (WidgetStateStore::new(outbox.clone()), outbox)
}

fn wid(id: &str) -> WidgetId {
    WidgetId::from(id)
}

fn fid(id: &str) -> FormId {
    FormId::from(id)
}

fn declare(store: &mut WidgetStateStore, id: &str, default: WidgetValue, form: Option<&str>) {
    store
        .declare_widget(WidgetDeclaration {
            widget_id: wid(id),
            default,
            value: None,
            form_id: form.map(fid),
        })
        .expect("declare widget");
}

fn state(id: &str, value: WidgetValue) -> WidgetState {
    WidgetState {
        widget_id: wid(id),
        value,
    }
}

#[test]
fn form_edits_stay_local_until_submit() {
    let (mut store, outbox) = store();
    store.declare_form(&fid("f1"), true, true);
    declare(&mut store, "w1", WidgetValue::Int(0), Some("f1"));
    declare(&mut store, "w2", WidgetValue::String(String::new()), Some("f1"));

    assert_eq!(
        store.set_value(&wid("w1"), WidgetValue::Int(7), ValueSource::Ui, None),
        Ok(Delivery::Buffered)
    );
    assert_eq!(
        store.set_value(
            &wid("w2"),
            WidgetValue::String("hi".into()),
            ValueSource::Ui,
            Some(&fid("f1"))
        ),
        Ok(Delivery::Buffered)
    );
    assert!(outbox.sent().is_empty());
    assert_eq!(store.get_value(&wid("w1")), Some(&WidgetValue::Int(7)));
    assert_eq!(store.forms_with_pending_changes(), vec![fid("f1")]);

    assert_eq!(store.submit_form(&fid("f1")), Ok(2));
    assert_eq!(
        outbox.take(),
        vec![ClientMessage::FormSubmitted {
            form_id: fid("f1"),
            widgets: vec![
                state("w1", WidgetValue::Int(7)),
                state("w2", WidgetValue::String("hi".into())),
            ],
        }]
    );

    // clear_on_submit puts members back to their defaults without another send.
    assert_eq!(store.get_value(&wid("w1")), Some(&WidgetValue::Int(0)));
    assert_eq!(
        store.get_value(&wid("w2")),
        Some(&WidgetValue::String(String::new()))
    );
    assert!(!store.is_dirty(&wid("w1")));
    assert!(store.forms_with_pending_changes().is_empty());
    assert!(outbox.sent().is_empty());
}

#[test]
fn cleared_form_resets_to_default_and_notifies_once() {
    let (mut store, outbox) = store();
    store.declare_form(&fid("f1"), true, true);
    declare(&mut store, "w1", WidgetValue::String("a".into()), Some("f1"));

    let fired = Arc::new(Mutex::new(Vec::<FormId>::new()));
    let sink = fired.clone();
    store.add_form_cleared_listener(&fid("f1"), "text-input-w1", move |form| {
        sink.lock().expect("fired").push(form.clone())
    });

    store
        .set_value(&wid("w1"), WidgetValue::String("b".into()), ValueSource::Ui, None)
        .expect("set");
    assert_eq!(
        store.get_value(&wid("w1")),
        Some(&WidgetValue::String("b".into()))
    );
    assert!(outbox.sent().is_empty());

    store.submit_form(&fid("f1")).expect("submit");
    assert_eq!(
        outbox.take(),
        vec![ClientMessage::FormSubmitted {
            form_id: fid("f1"),
            widgets: vec![state("w1", WidgetValue::String("b".into()))],
        }]
    );
    assert_eq!(
        store.get_value(&wid("w1")),
        Some(&WidgetValue::String("a".into()))
    );
    assert_eq!(*fired.lock().expect("fired"), vec![fid("f1")]);
}

#[test]
fn submit_without_clear_keeps_values() {
    let (mut store, outbox) = store();
    store.declare_form(&fid("f1"), false, true);
    declare(&mut store, "w1", WidgetValue::Bool(false), Some("f1"));

    store
        .set_value(&wid("w1"), WidgetValue::Bool(true), ValueSource::Ui, None)
        .expect("set");
    store.submit_form(&fid("f1")).expect("submit");

    assert_eq!(outbox.sent().len(), 1);
    assert_eq!(store.get_value(&wid("w1")), Some(&WidgetValue::Bool(true)));
}

#[test]
fn free_standing_edit_sends_exactly_one_message() {
    let (mut store, outbox) = store();
    declare(&mut store, "slider", WidgetValue::Double(0.5), None);

    assert_eq!(
        store.set_value(&wid("slider"), WidgetValue::Double(0.75), ValueSource::Ui, None),
        Ok(Delivery::Sent)
    );
    assert_eq!(
        outbox.take(),
        vec![ClientMessage::WidgetStatesChanged {
            widgets: vec![state("slider", WidgetValue::Double(0.75))],
        }]
    );
    assert!(!store.is_dirty(&wid("slider")));
}

#[test]
fn rapid_edits_are_each_delivered_in_order() {
    let (mut store, outbox) = store();
    declare(&mut store, "counter", WidgetValue::Int(0), None);

    for value in 1..=40 {
        store
            .set_value(&wid("counter"), WidgetValue::Int(value), ValueSource::Ui, None)
            .expect("set");
    }

    let sent: Vec<i64> = outbox
        .take()
        .into_iter()
        .map(|message| match message {
            ClientMessage::WidgetStatesChanged { widgets } => match widgets.as_slice() {
                [WidgetState {
                    value: WidgetValue::Int(value),
                    ..
                }] => *value,
                other => panic!("unexpected batch: {other:?}"),
            },
            other => panic!("unexpected message: {other:?}"),
        })
        .collect();
    assert_eq!(sent, (1..=40).collect::<Vec<_>>());
    assert_eq!(store.get_value(&wid("counter")), Some(&WidgetValue::Int(40)));
}

#[test]
fn host_writes_never_echo_back() {
    let (mut store, outbox) = store();
    assert_eq!(
        store.set_value(&wid("w1"), WidgetValue::Int(1), ValueSource::Host, None),
        Ok(Delivery::Stored)
    );
    assert_eq!(
        store.set_value(&wid("w1"), WidgetValue::Int(2), ValueSource::Host, None),
        Ok(Delivery::Stored)
    );
    assert!(outbox.sent().is_empty());
    assert_eq!(store.get_value(&wid("w1")), Some(&WidgetValue::Int(2)));
}

#[test]
fn user_write_to_unknown_widget_is_rejected() {
    let (mut store, outbox) = store();
    assert_eq!(
        store.set_value(&wid("ghost"), WidgetValue::Int(1), ValueSource::Ui, None),
        Err(WidgetStateError::UnknownWidget(wid("ghost")))
    );
    assert!(store.is_empty());
    assert!(outbox.sent().is_empty());
}

#[test]
fn wrong_kind_or_invalid_value_keeps_previous_value() {
    let (mut store, outbox) = store();
    declare(&mut store, "w1", WidgetValue::Int(3), None);
    declare(&mut store, "payload", WidgetValue::Json("{}".into()), None);

    assert_eq!(
        store.set_value(&wid("w1"), WidgetValue::Bool(true), ValueSource::Ui, None),
        Err(WidgetStateError::KindMismatch {
            widget_id: wid("w1"),
            expected: WidgetKind::Int,
            actual: WidgetKind::Bool,
        })
    );
    assert!(matches!(
        store.set_value(&wid("w1"), WidgetValue::Double(f64::NAN), ValueSource::Ui, None),
        Err(WidgetStateError::InvalidValue { .. })
    ));
    assert!(matches!(
        store.set_value(
            &wid("payload"),
            WidgetValue::Json("{not json".into()),
            ValueSource::Ui,
            None
        ),
        Err(WidgetStateError::InvalidValue { .. })
    ));

    assert_eq!(store.get_value(&wid("w1")), Some(&WidgetValue::Int(3)));
    assert_eq!(
        store.get_value(&wid("payload")),
        Some(&WidgetValue::Json("{}".into()))
    );
    assert!(outbox.sent().is_empty());
}

#[test]
fn declaration_with_mismatched_value_is_rejected() {
    let (mut store, _outbox) = store();
    let err = store
        .declare_widget(WidgetDeclaration {
            widget_id: wid("w1"),
            default: WidgetValue::Int(0),
            value: Some(WidgetValue::String("x".into())),
            form_id: None,
        })
        .expect_err("kind mismatch");
    assert!(matches!(err, WidgetStateError::KindMismatch { .. }));
    assert!(store.get_value(&wid("w1")).is_none());
}

#[test]
fn triggers_reset_after_delivery() {
    let (mut store, outbox) = store();
    declare(&mut store, "button", WidgetValue::Trigger(false), None);
    declare(&mut store, "chat", WidgetValue::StringTrigger(None), None);

    store
        .set_value(&wid("button"), WidgetValue::Trigger(true), ValueSource::Ui, None)
        .expect("press");
    store
        .set_value(
            &wid("chat"),
            WidgetValue::StringTrigger(Some("hello".into())),
            ValueSource::Ui,
            None,
        )
        .expect("submit chat");

    assert_eq!(
        outbox.take(),
        vec![
            ClientMessage::WidgetStatesChanged {
                widgets: vec![state("button", WidgetValue::Trigger(true))],
            },
            ClientMessage::WidgetStatesChanged {
                widgets: vec![state("chat", WidgetValue::StringTrigger(Some("hello".into())))],
            },
        ]
    );
    assert_eq!(store.get_value(&wid("button")), Some(&WidgetValue::Trigger(false)));
    assert_eq!(store.get_value(&wid("chat")), Some(&WidgetValue::StringTrigger(None)));
}

#[test]
fn form_cleared_listener_is_replaced_per_owner() {
    let (mut store, _outbox) = store();
    store.declare_form(&fid("f1"), true, true);
    store.declare_form(&fid("f2"), true, true);
    declare(&mut store, "w1", WidgetValue::Int(0), Some("f1"));

    let calls = Arc::new(Mutex::new(Vec::<String>::new()));
    let first = {
        let calls = calls.clone();
        store.add_form_cleared_listener(&fid("f1"), "input-a", move |form| {
            calls.lock().expect("calls").push(format!("first:{form}"))
        })
    };
    let second = {
        let calls = calls.clone();
        store.add_form_cleared_listener(&fid("f1"), "input-a", move |form| {
            calls.lock().expect("calls").push(format!("second:{form}"))
        })
    };
    assert_eq!(store.form(&fid("f1")).map(FormRecord::listener_count), Some(1));
    assert_eq!(first, second);

    store.submit_form(&fid("f1")).expect("submit");
    assert_eq!(*calls.lock().expect("calls"), vec!["second:f1".to_string()]);

    // Re-registering under another form moves the subscription.
    let moved = store.add_form_cleared_listener(&fid("f2"), "input-a", |_| {});
    assert_eq!(store.form(&fid("f1")).map(FormRecord::listener_count), Some(0));
    assert!(!store.remove_form_cleared_listener(&second));
    assert!(store.remove_form_cleared_listener(&moved));
    assert_eq!(store.form(&fid("f2")).map(FormRecord::listener_count), Some(0));
}

#[test]
fn listeners_only_fire_when_form_clears() {
    let (mut store, _outbox) = store();
    store.declare_form(&fid("f1"), false, true);
    declare(&mut store, "w1", WidgetValue::Int(0), Some("f1"));

    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    store.add_form_cleared_listener(&fid("f1"), "input-a", move |_| {
        *counter.lock().expect("calls") += 1
    });
    store.submit_form(&fid("f1")).expect("submit");
    assert_eq!(*calls.lock().expect("calls"), 0);
}

#[test]
fn failed_submit_keeps_buffered_edits() {
    let (mut store, outbox) = store();
    store.declare_form(&fid("f1"), true, true);
    declare(&mut store, "w1", WidgetValue::Int(0), Some("f1"));
    store
        .set_value(&wid("w1"), WidgetValue::Int(9), ValueSource::Ui, None)
        .expect("set");

    outbox.set_offline(true);
    assert!(matches!(
        store.submit_form(&fid("f1")),
        Err(WidgetStateError::SubmitFailed { .. })
    ));
    assert_eq!(store.get_value(&wid("w1")), Some(&WidgetValue::Int(9)));
    assert!(store.is_dirty(&wid("w1")));

    outbox.set_offline(false);
    assert_eq!(store.submit_form(&fid("f1")), Ok(1));
}

#[test]
fn unknown_form_cannot_be_submitted() {
    let (mut store, _outbox) = store();
    assert_eq!(
        store.submit_form(&fid("nope")),
        Err(WidgetStateError::UnknownForm(fid("nope")))
    );
}

#[test]
fn undeliverable_edits_are_flushed_later() {
    let (mut store, outbox) = store();
    declare(&mut store, "b", WidgetValue::Int(0), None);
    declare(&mut store, "a", WidgetValue::Int(0), None);
    declare(&mut store, "in_form", WidgetValue::Int(0), Some("f1"));

    outbox.set_offline(true);
    assert_eq!(
        store.set_value(&wid("b"), WidgetValue::Int(2), ValueSource::Ui, None),
        Ok(Delivery::Deferred)
    );
    assert_eq!(
        store.set_value(&wid("a"), WidgetValue::Int(1), ValueSource::Ui, None),
        Ok(Delivery::Deferred)
    );
    store
        .set_value(&wid("in_form"), WidgetValue::Int(5), ValueSource::Ui, None)
        .expect("buffer");
    assert_eq!(store.flush_dirty(), 0);
    assert!(store.is_dirty(&wid("a")));

    outbox.set_offline(false);
    assert_eq!(store.flush_dirty(), 2);
    assert_eq!(
        outbox.take(),
        vec![ClientMessage::WidgetStatesChanged {
            widgets: vec![state("a", WidgetValue::Int(1)), state("b", WidgetValue::Int(2))],
        }]
    );
    assert!(store.is_dirty(&wid("in_form")));
    assert_eq!(store.flush_dirty(), 0);
}

#[test]
fn successful_run_reports_forms_without_submit_button() {
    let (mut store, _outbox) = store();
    store.begin_script_run();
    store.declare_form(&fid("f_ok"), false, true);
    store.declare_form(&fid("f_missing"), false, false);

    assert_eq!(
        store.end_script_run(ScriptFinishStatus::Success),
        vec![Diagnostic::MissingSubmitButton {
            form_id: fid("f_missing")
        }]
    );

    store.begin_script_run();
    store.declare_form(&fid("f_missing"), false, false);
    assert!(store.end_script_run(ScriptFinishStatus::Error).is_empty());
}

#[test]
fn successful_run_drops_undeclared_widgets() {
    let (mut store, _outbox) = store();
    store.begin_script_run();
    declare(&mut store, "kept", WidgetValue::Int(1), None);
    declare(&mut store, "dropped", WidgetValue::Int(2), None);
    store.end_script_run(ScriptFinishStatus::Success);

    store.begin_script_run();
    declare(&mut store, "kept", WidgetValue::Int(1), None);
    store.end_script_run(ScriptFinishStatus::InterruptedForRerun);
    assert_eq!(store.len(), 2);

    store.begin_script_run();
    declare(&mut store, "kept", WidgetValue::Int(1), None);
    store.end_script_run(ScriptFinishStatus::Success);
    assert_eq!(store.len(), 1);
    assert!(store.record(&wid("dropped")).is_none());
}

#[test]
fn resync_discards_unsent_edits() {
    let (mut store, outbox) = store();
    declare(&mut store, "w1", WidgetValue::Int(0), Some("f1"));
    store
        .set_value(&wid("w1"), WidgetValue::Int(4), ValueSource::Ui, None)
        .expect("buffer");

    store.resync_from_defaults();
    assert_eq!(store.get_value(&wid("w1")), Some(&WidgetValue::Int(0)));
    assert!(!store.is_dirty(&wid("w1")));
    assert!(outbox.sent().is_empty());
}

#[test]
fn new_session_drops_forms_and_listeners() {
    let (mut store, _outbox) = store();
    store.declare_form(&fid("f1"), true, true);
    let subscription = store.add_form_cleared_listener(&fid("f1"), "input-a", |_| {});

    store.begin_session();
    assert!(store.form(&fid("f1")).is_none());
    assert!(!store.remove_form_cleared_listener(&subscription));
}
