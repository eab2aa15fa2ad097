//! Structured log events emitted by holders, captured with a
//! `tracing-subscriber` layer.

use std::sync::{Arc, Mutex};

use holdfast_core::{
    EnvHandle, FaultLog, HandleHost, InstanceRegistry, Lifecycle, MessageError, Notifier,
    NotifierConfig,
};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};

#[derive(Default)]
struct Captured {
    messages: Vec<String>,
}

struct EventCapture {
    state: Arc<Mutex<Captured>>,
}

impl<S> Layer<S> for EventCapture
where
    S: tracing::Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        struct Msg {
            message: Option<String>,
        }
        impl tracing::field::Visit for Msg {
            fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
                if field.name() == "message" {
                    self.message = Some(value.to_string());
                }
            }

            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.message = Some(format!("{value:?}").trim_matches('"').to_string());
                }
            }
        }
        let mut msg = Msg { message: None };
        event.record(&mut msg);
        if let Some(message) = msg.message {
            self.state.lock().expect("capture lock").messages.push(message);
        }
    }
}

fn capture() -> (Arc<Mutex<Captured>>, tracing::subscriber::DefaultGuard) {
    let state = Arc::new(Mutex::new(Captured::default()));
    let subscriber = tracing_subscriber::registry().with(EventCapture {
        state: Arc::clone(&state),
    });
    let guard = tracing::subscriber::set_default(subscriber);
    (state, guard)
}

fn saw(state: &Mutex<Captured>, message: &str) -> bool {
    state
        .lock()
        .expect("capture lock")
        .messages
        .iter()
        .any(|m| m == message)
}

#[test]
fn registry_and_notifier_events() {
    let (state, _guard) = capture();

    let registry = InstanceRegistry::default();
    let n = registry.notifier(Some("counter"), || 0u32);
    let _again = registry.notifier(Some("counter"), || 0u32);
    let _sub = n.subscribe(|| {});
    n.set(1);
    registry.cleanup();

    assert!(saw(&state, "registry.track"), "expected registry.track");
    assert!(saw(&state, "registry.reuse"), "expected registry.reuse");
    assert!(saw(&state, "listeners.notify"), "expected listeners.notify");
    assert!(saw(&state, "notifier.dispose"), "expected notifier.dispose");
    assert!(saw(&state, "registry.cleanup"), "expected registry.cleanup");
}

#[test]
fn lifecycle_events() {
    let (state, _guard) = capture();

    let lc = Lifecycle::builder(0u8)
        .build(|_| Ok::<(), MessageError>(()))
        .expect("init succeeds");
    let _lease = lc.broker().attach(EnvHandle::new("w"));

    assert!(saw(&state, "lifecycle.init"), "expected lifecycle.init");
    assert!(saw(&state, "handle.transition"), "expected handle.transition");
}

#[test]
fn isolated_listener_fault_is_logged_and_recorded() {
    let (state, _guard) = capture();
    let log = Arc::new(FaultLog::new());

    let n = Notifier::with_config(
        0,
        NotifierConfig::default()
            .label("panicky")
            .fault_sink(log.clone()),
    );
    let _bad = n.subscribe(|| panic!("listener exploded"));
    n.set(1);

    let faults = log.take();
    assert_eq!(faults.len(), 1);
    assert_eq!(&*faults[0].origin, "panicky");
    assert!(faults[0].message.contains("listener exploded"));
    assert!(!saw(&state, "fault.isolated"), "custom sink replaces the default");

    let default_sink = Notifier::new(0);
    let _bad = default_sink.subscribe(|| panic!("again"));
    default_sink.set(1);
    assert!(saw(&state, "fault.isolated"), "expected fault.isolated");
}
