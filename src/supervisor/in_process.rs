//! In-process sessions. No isolation: a crashing or hanging plugin takes the
//! controller with it. Meant for debugging plugins under a debugger.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{
    EventSender, InFlight, SessionOutcome, SessionState, SessionStateMachine, SupervisorConfig,
    SupervisorError, ValidationEvent,
};
use crate::config::ValidationOptions;
use crate::engine::{EngineListener, TestEngine, TestResult};
use crate::realtime::{AllocInterceptor, ViolationPolicy};

/// Forwards engine output to the session's event stream.
struct ChannelListener {
    events: Arc<EventSender>,
    in_flight: Mutex<InFlight>,
}

impl EngineListener for ChannelListener {
    fn log(&self, text: &str) {
        self.in_flight.lock().observe_log(text);
        self.events.send(ValidationEvent::Log(text.to_string()));
    }

    fn item_complete(&self, result: &TestResult) {
        self.in_flight.lock().observe_complete(&result.name);
        self.events.send(ValidationEvent::item_complete(result.clone()));
    }
}

/// The controller must never abort itself.
fn effective_policy(requested: ViolationPolicy) -> ViolationPolicy {
    match requested {
        ViolationPolicy::Abort => ViolationPolicy::RaiseError,
        other => other,
    }
}

pub(super) async fn run(
    config: &SupervisorConfig,
    state: &mut SessionStateMachine,
    target: &str,
    options: &ValidationOptions,
    events: &EventSender,
    cancel: &CancellationToken,
) -> Result<SessionOutcome, SupervisorError> {
    state.transition(SessionState::Starting)?;

    let mut options = options.clone();
    let policy = effective_policy(options.violation_policy);
    if policy != options.violation_policy {
        tracing::warn!("abort policy is not allowed in-process; using raise");
        options.violation_policy = policy;
    }

    // Events flow through a second sender so the blocking engine thread can
    // outlive a cancelled session without holding the caller's sender.
    let (inner, mut inner_rx) = EventSender::channel();
    let listener = Arc::new(ChannelListener {
        events: Arc::new(inner),
        in_flight: Mutex::new(InFlight::default()),
    });

    events.send(ValidationEvent::Started {
        target: target.to_string(),
        worker_pid: None,
    });
    state.transition(SessionState::Running)?;
    AllocInterceptor::install(policy);

    let formats = config.formats.clone();
    let registry = config.registry.clone();
    let engine_config = config.engine;
    let crash_trace = config.crash_trace.clone();
    let owned_target = target.to_string();
    let engine_listener: Arc<dyn EngineListener> = listener.clone();
    let mut task = tokio::task::spawn_blocking(move || {
        TestEngine::new(formats, &registry)
            .with_config(engine_config)
            .with_crash_trace(crash_trace)
            .run(&owned_target, &options, engine_listener)
    });

    let joined = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break None,
            Some(event) = inner_rx.recv() => {
                events.send(event);
            }
            joined = &mut task => break Some(joined),
        }
    };
    // Deliver whatever the engine produced before it returned.
    while let Ok(event) = inner_rx.try_recv() {
        events.send(event);
    }
    AllocInterceptor::shutdown();

    let (outcome, reason, summary) = match joined {
        None => (SessionOutcome::Cancelled, "Validation cancelled".to_string(), None),
        Some(Ok(Ok(summary))) => (SessionOutcome::Completed, String::new(), Some(summary)),
        Some(Ok(Err(e))) => (SessionOutcome::Disconnected, e.to_string(), None),
        Some(Err(e)) => (
            SessionOutcome::Crashed,
            format!("Validation thread failed: {e}"),
            None,
        ),
    };
    state.transition(SessionState::from_outcome(outcome))?;

    match summary {
        Some(summary) => {
            events.send(ValidationEvent::AllComplete {
                tests: summary.tests,
                failures: summary.failures,
                seed: summary.seed,
            });
        }
        None => {
            let result = listener.in_flight.lock().take_incomplete(reason.clone());
            events.send(ValidationEvent::item_complete(result));
            events.send(ValidationEvent::ConnectionLost { outcome, reason });
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_is_downgraded() {
        assert_eq!(effective_policy(ViolationPolicy::Abort), ViolationPolicy::RaiseError);
        assert_eq!(effective_policy(ViolationPolicy::LogOnly), ViolationPolicy::LogOnly);
        assert_eq!(
            effective_policy(ViolationPolicy::RaiseError),
            ViolationPolicy::RaiseError
        );
    }
}
