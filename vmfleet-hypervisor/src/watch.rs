//! Polling lifecycle event source.
//!
//! Used by backends without a native event channel: the domain list is
//! polled periodically and state changes are turned into lifecycle events.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::traits::{DomainEventStream, Hypervisor};
use crate::types::{lifecycle, DomainState, DomainSummary, RawDomainEvent};

/// Default polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Code of the event announcing `to`, coming from `from`.
fn transition_code(from: Option<DomainState>, to: DomainState) -> Option<i32> {
    match to {
        DomainState::Running => match from {
            Some(DomainState::Paused) | Some(DomainState::Suspended) => Some(lifecycle::RESUMED),
            _ => Some(lifecycle::STARTED),
        },
        DomainState::Paused => Some(lifecycle::SUSPENDED),
        DomainState::Suspended => Some(lifecycle::PMSUSPENDED),
        DomainState::Stopped => match from {
            // freshly defined domains start out stopped
            None => None,
            _ => Some(lifecycle::STOPPED),
        },
        DomainState::Crashed => Some(lifecycle::CRASHED),
        DomainState::Unknown => None,
    }
}

fn event(uuid: &str, code: i32) -> RawDomainEvent {
    RawDomainEvent {
        domain_uuid: uuid.to_string(),
        code,
        detail: 0,
    }
}

/// Compare two domain listings and synthesize the events between them.
///
/// `known` is updated to reflect `current`.
pub fn diff_states(
    known: &mut HashMap<String, DomainState>,
    current: &[DomainSummary],
) -> Vec<RawDomainEvent> {
    let mut events = Vec::new();

    for domain in current {
        match known.get(&domain.uuid).copied() {
            None => {
                events.push(event(&domain.uuid, lifecycle::DEFINED));
                if let Some(code) = transition_code(None, domain.state) {
                    events.push(event(&domain.uuid, code));
                }
            }
            Some(previous) if previous != domain.state => {
                if let Some(code) = transition_code(Some(previous), domain.state) {
                    events.push(event(&domain.uuid, code));
                }
            }
            Some(_) => {}
        }
        known.insert(domain.uuid.clone(), domain.state);
    }

    let gone: Vec<String> = known
        .keys()
        .filter(|uuid| !current.iter().any(|d| &d.uuid == *uuid))
        .cloned()
        .collect();

    for uuid in gone {
        if let Some(previous) = known.remove(&uuid) {
            if previous.is_active() {
                events.push(event(&uuid, lifecycle::STOPPED));
            }
            events.push(event(&uuid, lifecycle::UNDEFINED));
        }
    }

    events
}

/// Start polling `source` and return the resulting event stream.
///
/// The first listing is the baseline and produces no events. The poller
/// stops when the stream is dropped, when the source is gone, or after
/// reporting a lost connection.
pub fn spawn_poller(
    source: Weak<dyn Hypervisor>,
    poll_interval: Duration,
    buffer: usize,
) -> DomainEventStream {
    let (tx, rx) = mpsc::channel(buffer.max(1));

    tokio::spawn(async move {
        let mut timer = interval(poll_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut known: Option<HashMap<String, DomainState>> = None;

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                _ = timer.tick() => {}
            }

            let handle: Arc<dyn Hypervisor> = match source.upgrade() {
                Some(handle) => handle,
                None => break,
            };

            let listing = handle.list_domains().await;
            drop(handle);

            match listing {
                Ok(domains) => match known.as_mut() {
                    None => {
                        debug!(domains = domains.len(), "Event poller baseline taken");
                        let mut baseline = HashMap::new();
                        diff_states(&mut baseline, &domains);
                        known = Some(baseline);
                    }
                    Some(known) => {
                        for ev in diff_states(known, &domains) {
                            if tx.send(Ok(ev)).await.is_err() {
                                return;
                            }
                        }
                    }
                },
                Err(e) if e.is_connection_loss() => {
                    info!(error = %e, "Event poller lost its connection");
                    let _ = tx.send(Err(e)).await;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Event poll failed, retrying on next tick");
                }
            }
        }

        debug!("Event poller stopped");
    });

    rx
}
