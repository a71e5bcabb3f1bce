//! # Agent Probe
//!
//! Connects to the local trace agent, logs every handshake transition and,
//! once the connection is ready, sends a few synthetic spans and a change
//! event to confirm the data path end to end.
//!
//! The agent is located the same way the library does it: `TRACER_AGENT_HOST`
//! and `TRACER_AGENT_PORT` if set, then `localhost`, then the default gateway.
//!
//! ## Running
//!
//! ```bash
//! # Wait up to 30s for the agent, send 10 spans
//! cargo run -p agent_uplink --bin agent_probe
//!
//! # Shorter wait, more spans, debug logging
//! RUST_LOG=agent_uplink=debug cargo run -p agent_uplink --bin agent_probe -- --timeout 5 --spans 50
//! ```

use agent_uplink::{
    AgentClient, AgentConfig, AgentEvent, AttributeValue, ConnectivityState, EventSeverity,
    HostAgent, PendingContext, Span, SpanKind, SpanStatus,
};
use anyhow::{bail, Context};
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct Options {
    timeout: Duration,
    spans: u64,
}

fn parse_options() -> anyhow::Result<Options> {
    let mut options = Options {
        timeout: Duration::from_secs(30),
        spans: 10,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--timeout" => {
                let secs: u64 = args
                    .next()
                    .context("--timeout needs a value")?
                    .parse()
                    .context("--timeout must be a number of seconds")?;
                options.timeout = Duration::from_secs(secs);
            }
            "--spans" => {
                options.spans = args
                    .next()
                    .context("--spans needs a value")?
                    .parse()
                    .context("--spans must be a number")?;
            }
            other => bail!("unknown argument {other:?} (expected --timeout or --spans)"),
        }
    }
    Ok(options)
}

fn synthetic_span(rng: &mut impl Rng, trace_id: u128, index: u64) -> Span {
    let mut span = Span::new(
        trace_id,
        rng.gen(),
        0,
        format!("GET /probe/{index}"),
        SpanKind::Server,
    );
    span.set_attribute("http.method", "GET");
    span.set_attribute("synthetic.index", AttributeValue::Int(index as i64));
    span.finish(SpanStatus::Ok);
    span
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agent_uplink=info")),
        )
        .init();

    let options = parse_options()?;
    let config = AgentConfig::from_env()?;
    info!(host = ?config.host, port = config.port, "probing agent");

    let agent = HostAgent::connect(config);
    let mut states = agent.machine().subscribe();
    let started = Instant::now();

    let outcome = tokio::time::timeout(options.timeout, async {
        loop {
            let state = *states.borrow_and_update();
            info!(%state, elapsed_ms = started.elapsed().as_millis() as u64, "handshake state");
            if state == ConnectivityState::Ready {
                return anyhow::Ok(());
            }
            states.changed().await?;
        }
    })
    .await;

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            agent.shutdown().await;
            return Err(err.context("handshake driver stopped"));
        }
        Err(_) => {
            let stats = agent.machine().stats();
            warn!(
                state = %agent.machine().current_state(),
                retries = stats.total_retries(),
                "agent not ready"
            );
            agent.shutdown().await;
            bail!("agent not ready after {:?}", options.timeout);
        }
    }

    if let Some(identity) = agent.machine().identity() {
        info!(entity_id = %identity.entity_id, host_id = %identity.host_id, "announced");
    }

    let mut rng = rand::thread_rng();
    let trace_id: u128 = rng.gen();
    for index in 0..options.spans {
        let span = synthetic_span(&mut rng, trace_id, index);
        agent.finish_span(span, PendingContext::default());
    }
    let sent = agent.flush().await.context("sending spans")?;
    info!(sent, "spans delivered");

    agent
        .send_event(&AgentEvent {
            title: "agent_probe".into(),
            text: format!("{sent} spans delivered"),
            duration: started.elapsed().as_millis() as u64,
            severity: EventSeverity::Change,
        })
        .await
        .context("sending event")?;

    agent.shutdown().await;
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "probe complete");
    Ok(())
}
