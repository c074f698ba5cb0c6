//! Tracing bridge
//!
//! Re-emits bus events as structured `tracing` events so that whatever
//! subscriber the host installed (fmt, OpenTelemetry, ...) sees the run.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bus::{EventBus, EventStream};
use super::types::{Event, EventKind};

/// Target used for bridged events, so hosts can filter them separately
pub const TRACE_TARGET: &str = "triad_coordination::run";

/// Background task forwarding matching events to `tracing`
pub struct TraceBridge {
    cancel: CancellationToken,
    handle: JoinHandle<u64>,
}

impl TraceBridge {
    /// Subscribe to `pattern` and start forwarding.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(bus: &EventBus, pattern: &str) -> Self {
        let stream = bus.subscribe(pattern);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(forward(stream, cancel.clone()));
        debug!(pattern, "Trace bridge started");
        Self { cancel, handle }
    }

    /// Stop forwarding and return the number of events bridged
    pub async fn shutdown(self) -> u64 {
        self.cancel.cancel();
        match self.handle.await {
            Ok(count) => {
                debug!(count, "Trace bridge stopped");
                count
            }
            Err(e) => {
                warn!(error = %e, "Trace bridge task failed");
                0
            }
        }
    }
}

async fn forward(mut stream: EventStream, cancel: CancellationToken) -> u64 {
    let mut count = 0;
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(event) => event,
                None => break,
            },
        };
        record(&event);
        count += 1;
    }
    count
}

/// Emit one event as a `tracing` record
pub fn record(event: &Event) {
    let event_type = event.event_type();
    let run_id = event.run_id.as_str();

    match &event.kind {
        EventKind::ErrorOccurred {
            error_type,
            message,
            ..
        } => {
            warn!(
                target: TRACE_TARGET,
                event_type,
                run_id,
                error_type = %error_type,
                agent_id = event.agent_id(),
                triad_id = event.triad_id(),
                "{}",
                message
            );
        }
        EventKind::UsageRecorded {
            prompt_tokens,
            completion_tokens,
            ..
        } => {
            info!(
                target: TRACE_TARGET,
                event_type,
                run_id,
                triad_id = event.triad_id(),
                prompt_tokens,
                completion_tokens,
                "usage"
            );
        }
        _ => {
            info!(
                target: TRACE_TARGET,
                event_type,
                run_id,
                agent_id = event.agent_id(),
                triad_id = event.triad_id(),
                phase_id = event.phase_id(),
                section = event.section_name(),
                "event"
            );
        }
    }
}
