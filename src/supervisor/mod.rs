//! Supervisor: the router task that owns the hub.
//!
//! [`run`] is the event loop. It drains the event bus into [`HubCore`],
//! answers the management socket, opens the connections the core asks for,
//! reaps children on a fixed interval and drives the shutdown sequence.
//! After an interrupt the hub asks everyone to quit; if the grace period
//! runs out it escalates to an emergency shutdown before giving up.

#[cfg(feature = "management-socket")]
pub mod adapters;
pub mod bus;
pub mod control;

use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::hub::HubCore;
use crate::net;

use bus::{BusHandle, HubEvent};
use control::{ControlCommand, ControlError, ControlMessage, ControlResponse, ControlResult};

/// Run the hub until it decides to exit. Returns the process exit status.
///
/// Cancelling `shutdown` counts as a user interrupt.
pub async fn run(
    mut core: HubCore,
    mut events: mpsc::Receiver<HubEvent>,
    bus: BusHandle,
    mut control: mpsc::Receiver<ControlMessage>,
    shutdown: CancellationToken,
) -> i32 {
    let started_at = Instant::now();
    let mut reap = time::interval(core.reap_interval());
    reap.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut grace: Option<time::Instant> = None;
    let mut control_open = true;

    info!(hub = core.hub_id(), master = core.is_master(), "hub running");

    loop {
        for request in core.take_dial_requests() {
            debug!(host = %request.host, port = request.port, "dialing");
            net::spawn_dial(request, bus.clone());
        }

        if let Some(code) = core.exit_status() {
            info!(code, "hub exiting");
            return code;
        }

        // An orderly quit waits for the children however long they take.
        if (core.is_interrupted() || core.is_emergency()) && grace.is_none() {
            grace = Some(time::Instant::now() + core.grace());
        }
        let deadline = grace.unwrap_or_else(time::Instant::now);

        tokio::select! {
            biased;

            _ = shutdown.cancelled(), if !core.is_interrupted() => {
                core.interrupt();
            }

            _ = time::sleep_until(deadline), if grace.is_some() => {
                if core.is_emergency() {
                    error!("children did not exit after emergency shutdown");
                    return 1;
                }
                warn!("shutdown grace period expired");
                core.emergency_quit("shutdown timed out");
                grace = Some(time::Instant::now() + core.grace());
            }

            event = events.recv() => match event {
                Some(event) => {
                    if let Err(e) = core.handle_event(event) {
                        if e.is_fatal() {
                            error!(error = %e, "fatal hub error");
                            core.emergency_quit(&e.to_string());
                        } else {
                            warn!(error = %e, "event handling failed");
                        }
                    }
                }
                None => {
                    error!("event bus closed");
                    return 1;
                }
            },

            msg = control.recv(), if control_open => match msg {
                Some(ControlMessage::Request { command, reply_tx }) => {
                    let uptime_ms = started_at.elapsed().as_millis() as u64;
                    let _ = reply_tx.send(answer(&mut core, command, uptime_ms));
                }
                Some(ControlMessage::Notification { command }) => {
                    if command == ControlCommand::Quit {
                        core.interrupt();
                    } else {
                        debug!(?command, "control notification ignored");
                    }
                }
                None => {
                    debug!("control channel closed");
                    control_open = false;
                }
            },

            _ = reap.tick() => core.reap_processes(),
        }
    }
}

fn answer(core: &mut HubCore, command: ControlCommand, uptime_ms: u64) -> ControlResult {
    match command {
        ControlCommand::Status => Ok(ControlResponse::Status {
            uptime_ms,
            hub: core.status(),
        }),
        ControlCommand::Slaves => {
            if !core.is_master() {
                return Err(ControlError::Unavailable {
                    message: "slave list is kept by the master hub".into(),
                });
            }
            Ok(ControlResponse::Slaves {
                slaves: core.slaves(),
            })
        }
        ControlCommand::Processes => Ok(ControlResponse::Processes {
            processes: core.processes(),
        }),
        ControlCommand::Quit => {
            info!("control requested shutdown");
            core.interrupt();
            Ok(ControlResponse::Ack {
                message: "shutdown requested".to_string(),
            })
        }
    }
}
