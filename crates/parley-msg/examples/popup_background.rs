//! ---
//! parley_section: "02-cross-context-messaging"
//! parley_subsection: "module"
//! parley_type: "source"
//! parley_scope: "code"
//! parley_description: "Cross-context message bus, arbitration and broadcaster."
//! parley_version: "v0.0.0-prealpha"
//! parley_owner: "tbd"
//! ---
//! A background context that owns speech, and a popup that drives it.
//!
//! Run with `PARLEY_LOG=parley_msg=debug` to see every envelope.
use std::sync::Arc;

use anyhow::Result;
use parley_common::{init_tracing, BusConfig};
use parley_msg::action::known;
use parley_msg::{
    Broadcaster, Bus, ContextId, ContextIdentity, ContextKind, EventHandler, HandlerOutcome,
    HostTransport, InMemoryHost, Pattern, Response,
};
use serde_json::json;

const CONFIG: &str = r#"
[logging]
format = "pretty"
file_prefix = "demo"

[host]
flavor = "strict"

[locate]
retry_interval_ms = 25
max_attempts = 20
"#;

#[tokio::main]
async fn main() -> Result<()> {
    let mut config: BusConfig = CONFIG.parse()?;
    config.logging.directory = std::env::temp_dir().join("parley-demo");

    // This process plays the background; the popup is a second in-memory context.
    let background_id = ContextIdentity::establish(ContextKind::Background)?.clone();
    init_tracing(background_id.as_str(), &config.logging)?;

    let host = Arc::new(InMemoryHost::new(config.host.flavor));
    let shared: Arc<dyn HostTransport> = host.clone();
    host.open_context(&background_id);
    let background = Broadcaster::new(Arc::new(Bus::connect(
        Arc::clone(&shared),
        background_id,
        config.locate.clone(),
        None,
    )));

    let popup_id = ContextId::generate(ContextKind::Popup);
    host.open_context(&popup_id);
    let popup = Broadcaster::new(Arc::new(Bus::connect(
        shared,
        popup_id,
        config.locate.clone(),
        None,
    )));

    let state = EventHandler::new(|_payload| async {
        HandlerOutcome::Value(json!({"speaking": true, "segment": 2, "total": 9}))
    });
    let stop = EventHandler::new(|payload| async move {
        tracing::info!(%payload, "stopping speech");
        HandlerOutcome::Done
    });
    let _state = background.register_listening_action(known::SPEAKING_STATE, &state)?;
    let stop_switch = background.register_listening_action(known::SPEAKING_STOP, &stop)?;

    let state = popup
        .broadcast_event(known::SPEAKING_STATE, &())
        .await?
        .into_iter()
        .find_map(Response::into_value);
    println!("speaking state: {state:?}");

    let replies = popup
        .broadcast_event_with(
            Pattern::AcknowledgedShout,
            known::SPEAKING_STOP,
            &json!({"reason": "popup closed"}),
        )
        .await?;
    println!("stop acknowledged: {}", replies.iter().any(|r| r.is_done()));

    stop_switch.kill();
    let replies = popup
        .broadcast_event_with(Pattern::AcknowledgedShout, known::SPEAKING_STOP, &())
        .await?;
    println!("stop acknowledged after kill: {}", !replies.is_empty());

    let stats = popup.bus().local().stats();
    println!("popup sent {} envelope(s)", stats.sent);
    Ok(())
}
