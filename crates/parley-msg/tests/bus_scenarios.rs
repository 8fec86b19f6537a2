//! ---
//! parley_section: "02-cross-context-messaging"
//! parley_subsection: "tests"
//! parley_type: "source"
//! parley_scope: "test"
//! parley_description: "End-to-end bus and broadcaster scenarios."
//! parley_version: "v0.0.0-prealpha"
//! parley_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parley_common::{BusConfig, HostFlavor, LocateConfig};
use parley_msg::action::known;
use parley_msg::{
    structured_clone, Action, Broadcaster, Bus, BusMetricsExporter, ContextId, ContextKind,
    EventHandler, HandlerOutcome, HostTransport, InMemoryHost, Listener, Pattern, Response,
};
use prometheus::Registry;
use serde_json::{json, Value};

fn locate() -> LocateConfig {
    LocateConfig {
        retry_interval: Duration::from_millis(1),
        max_attempts: 200,
    }
}

fn context(host: &Arc<InMemoryHost>, id: ContextId) -> Arc<Bus> {
    host.open_context(&id);
    let shared: Arc<dyn HostTransport> = host.clone();
    Arc::new(Bus::connect(shared, id, locate(), None))
}

fn action(name: &str) -> Action {
    Action::new(name).expect("valid action")
}

fn indifferent() -> Listener {
    Listener::new(|_env, _from| async { HandlerOutcome::Absent })
}

#[tokio::test]
async fn disallowed_sends_never_resolve_to_a_value() {
    let host = Arc::new(InMemoryHost::default());
    let background = context(&host, ContextId::background());
    let mut others = Vec::new();
    for kind in [ContextKind::Popup, ContextKind::Options, ContextKind::Content] {
        let bus = context(&host, ContextId::generate(kind));
        bus.listen(&indifferent()).expect("listen");
        others.push(bus);
    }
    background.listen(&indifferent()).expect("listen");

    let reset = action(known::PROGRESS_RESET);
    for sender in others.iter().chain(std::iter::once(&background)) {
        let trigger = sender.send(Pattern::Trigger, &reset, None).await.expect("trigger");
        assert_eq!(trigger, None);
        let shout = sender
            .send(Pattern::SilentShout, &reset, Some(json!({"x": 1})))
            .await
            .expect("shout");
        assert_eq!(shout, None);
    }
}

#[tokio::test]
async fn required_resolves_to_the_single_implementer() {
    let host = Arc::new(InMemoryHost::default());
    let background = context(&host, ContextId::background());
    let popup = context(&host, ContextId::generate(ContextKind::Popup));
    let options = context(&host, ContextId::generate(ContextKind::Options));
    options.listen(&indifferent()).expect("listen");

    let state = action(known::SPEAKING_STATE);
    assert_eq!(popup.request(&state, None).await.expect("request"), None);

    background
        .listen(&Listener::new(|env, _from| async move {
            if env.action().as_str() == known::SPEAKING_STATE {
                HandlerOutcome::Value(json!({"speaking": true, "segment": 4}))
            } else {
                HandlerOutcome::Absent
            }
        }))
        .expect("listen");
    assert_eq!(
        popup.request(&state, None).await.expect("request"),
        Some(Response::Value(json!({"speaking": true, "segment": 4})))
    );
}

#[tokio::test]
async fn acknowledgment_only_claims_on_done() {
    let host = Arc::new(InMemoryHost::default());
    let background = context(&host, ContextId::background());
    let stopped = action(known::SPEAKING_STOPPED);

    let mut pages = Vec::new();
    for _ in 0..4 {
        let page = context(&host, ContextId::generate(ContextKind::Options));
        page.listen(&indifferent()).expect("listen");
        pages.push(page);
    }
    assert!(!background.shout(&stopped, None, true).await.expect("shout"));

    pages[2]
        .listen(&Listener::new(|_env, _from| async { HandlerOutcome::Done }))
        .expect("listen");
    assert!(background.shout(&stopped, None, true).await.expect("shout"));
    assert_eq!(pages[2].local().stats().claimed, 1);
}

#[tokio::test]
async fn value_under_acknowledgment_is_a_violation() {
    let host = Arc::new(InMemoryHost::default());
    let background = context(&host, ContextId::background());
    let popup = context(&host, ContextId::generate(ContextKind::Popup));
    popup
        .listen(&Listener::new(|_env, _from| async {
            HandlerOutcome::Value(json!("finished"))
        }))
        .expect("listen");

    let response = background
        .send(Pattern::AcknowledgedShout, &action(known::SPEAKING_STOPPED), None)
        .await
        .expect("send");
    assert_eq!(response, None);
    assert_eq!(popup.local().stats().violations, 1);
    assert_eq!(popup.local().stats().claimed, 0);
}

#[tokio::test]
async fn popup_stops_speech_implemented_by_background() {
    let host = Arc::new(InMemoryHost::default());
    let background = Broadcaster::new(context(&host, ContextId::background()));
    let popup = Broadcaster::new(context(&host, ContextId::generate(ContextKind::Popup)));

    assert!(popup
        .broadcast_event(known::SPEAKING_STOP, &())
        .await
        .expect("nobody implements it yet")
        .is_empty());

    let stop = EventHandler::new(|_payload| async { HandlerOutcome::Value(json!({"stopped": true})) });
    let kill = background
        .register_listening_action(known::SPEAKING_STOP, &stop)
        .expect("register");
    assert_eq!(
        popup
            .broadcast_event(known::SPEAKING_STOP, &())
            .await
            .expect("broadcast"),
        vec![Response::Value(json!({"stopped": true}))]
    );

    assert!(kill.kill());
    assert!(!kill.kill());
    assert_eq!(host.listener_count(background.bus().context()), 0);
    assert!(popup
        .broadcast_event(known::SPEAKING_STOP, &())
        .await
        .expect("broadcast")
        .is_empty());
}

#[tokio::test]
async fn violating_listener_sends_no_reply_and_is_counted() {
    let host = Arc::new(InMemoryHost::default());
    let registry = Registry::new();
    let metrics = Arc::new(BusMetricsExporter::register(&registry).expect("metrics"));

    let background_id = ContextId::background();
    host.open_context(&background_id);
    let shared: Arc<dyn HostTransport> = host.clone();
    let background = Bus::connect(shared, background_id, locate(), Some(metrics));
    background
        .listen(&Listener::new(|_env, _from| async { HandlerOutcome::Value(json!(42)) }))
        .expect("listen");

    let popup = context(&host, ContextId::generate(ContextKind::Popup));
    let reset = action(known::PROGRESS_RESET);
    assert_eq!(
        popup.send(Pattern::Trigger, &reset, None).await.expect("trigger"),
        None
    );
    assert_eq!(background.local().stats().violations, 1);

    let violations = registry
        .gather()
        .into_iter()
        .find(|family| family.get_name() == "bus_protocol_violations_total")
        .expect("violations family");
    assert_eq!(violations.get_metric()[0].get_counter().get_value(), 1.0);
}

#[tokio::test]
async fn strict_hosts_still_deliver_late_answers() {
    let config: BusConfig = "[host]\nflavor = \"strict\"\n".parse().expect("config");
    assert_eq!(config.host.flavor, HostFlavor::Strict);

    let host = Arc::new(InMemoryHost::new(config.host.flavor));
    let background = context(&host, ContextId::background());
    let popup = context(&host, ContextId::generate(ContextKind::Popup));
    for _ in 0..3 {
        let page = context(&host, ContextId::generate(ContextKind::Options));
        page.listen(&indifferent()).expect("listen");
    }
    background
        .listen(&Listener::new(|_env, _from| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            HandlerOutcome::Value(json!(["en-GB", "fr-FR"]))
        }))
        .expect("listen");

    let voices = popup
        .request(&action(known::VOICES_LIST), None)
        .await
        .expect("request");
    assert_eq!(voices, Some(Response::Value(json!(["en-GB", "fr-FR"]))));
}

#[tokio::test]
async fn in_flight_answer_survives_unlisten() {
    let host = Arc::new(InMemoryHost::default());
    let background = context(&host, ContextId::background());
    let popup = context(&host, ContextId::generate(ContextKind::Popup));

    let slow = Listener::new(|_env, _from| async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        HandlerOutcome::Value(json!("late"))
    });
    background.listen(&slow).expect("listen");

    let sender = Arc::clone(&popup);
    let pending = tokio::spawn(async move {
        sender
            .request(&action(known::SPEAKING_STATE), None)
            .await
            .expect("request")
    });
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(background.unlisten(&slow));
    assert!(!background.local().on_message().has_listener(&slow));

    let answer = pending.await.expect("request task");
    assert_eq!(
        answer.and_then(Response::into_value),
        Some(json!("late"))
    );

    let after = popup
        .request(&action(known::SPEAKING_STATE), None)
        .await
        .expect("request");
    assert_eq!(after, None);
}

#[tokio::test]
async fn popup_waits_for_a_late_background() {
    let host = Arc::new(InMemoryHost::default());
    let popup = context(&host, ContextId::generate(ContextKind::Popup));

    let late = Arc::clone(&host);
    let starter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let background = context(&late, ContextId::background());
        background
            .listen(&Listener::new(|_env, _from| async { HandlerOutcome::Done }))
            .expect("listen");
        // Dropping the bus leaves its listener registered with the host.
    });

    // The popup's first send blocks until the background context is open.
    let stopped = popup
        .shout(&action(known::SPEAKING_STOP), None, true)
        .await
        .expect("shout");
    assert!(stopped);
    assert!(popup.remote().is_resolved());
    starter.await.expect("starter");
}

#[test]
fn plural_contexts_receive_distinct_identifiers() {
    for _ in 0..50 {
        let ids: HashSet<ContextId> = (0..20)
            .map(|_| ContextId::generate(ContextKind::Popup))
            .collect();
        assert_eq!(ids.len(), 20);
    }
    assert_eq!(ContextId::background(), ContextId::background());
}

#[tokio::test]
async fn payloads_arrive_deep_equal() {
    let host = Arc::new(InMemoryHost::default());
    let background = context(&host, ContextId::background());
    let popup = context(&host, ContextId::generate(ContextKind::Popup));

    background
        .listen(&Listener::new(|env, _from| async move {
            HandlerOutcome::Value(env.datum().cloned().unwrap_or(Value::Null))
        }))
        .expect("listen");

    let payload = json!({
        "text": "Il était une fois",
        "voice": {"name": "fr-FR", "rate": 0.9, "pitch": null},
        "segments": [[0, 12], [13, 40]],
        "flags": [true, false]
    });
    let sent = structured_clone(&payload).expect("clone");
    let echoed = popup
        .request(&action(known::SETTINGS_SET), Some(sent))
        .await
        .expect("request");
    assert_eq!(echoed, Some(Response::Value(payload)));
}
