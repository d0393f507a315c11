//! Single dispatcher that owns the negotiation machine.

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::commands::Command;
use crate::error::CallError;
use crate::events::{CallEvent, EventSink};
use crate::machine::NegotiationMachine;
use crate::peer::EngineEvent;
use crate::signaling::SignalEvent;

/// Inputs the dispatcher multiplexes.
pub struct Inputs {
    pub commands: mpsc::Receiver<Command>,
    pub signals: mpsc::Receiver<SignalEvent>,
    pub engine: mpsc::UnboundedReceiver<EngineEvent>,
    pub shutdown: watch::Receiver<bool>,
}

/// Resolves once shutdown is requested or its sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Runs until `quit`, shutdown, or every input closes. The call in progress,
/// if any, is ended on the way out. A command flow that is still waiting on
/// the network when shutdown arrives is abandoned.
pub async fn run(mut machine: NegotiationMachine, mut inputs: Inputs, events: EventSink) {
    let mut signals_open = true;
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut inputs.shutdown) => {
                info!("shutdown requested");
                break;
            }
            cmd = inputs.commands.recv() => match cmd {
                Some(Command::Quit) | None => break,
                Some(cmd) => tokio::select! {
                    _ = dispatch_command(&mut machine, cmd, &events) => {}
                    _ = shutdown_requested(&mut inputs.shutdown) => {
                        info!("shutdown requested, command abandoned");
                        break;
                    }
                },
            },
            sig = inputs.signals.recv(), if signals_open => match sig {
                Some(ev) => machine.handle_signal(ev).await,
                None => {
                    warn!("signaling event stream closed");
                    signals_open = false;
                }
            },
            Some(ev) = inputs.engine.recv() => machine.handle_engine_event(ev).await,
            Some(()) = machine.reap_submission() => {}
        }
    }

    if machine.state().in_progress() {
        if let Err(e) = machine.end_call().await {
            debug!("end on exit: {e}");
        }
    }
    machine.teardown().await;
    info!("dispatcher stopped");
}

pub async fn dispatch_command(machine: &mut NegotiationMachine, cmd: Command, events: &EventSink) {
    debug!(?cmd, "operator command");
    let report_directory = matches!(cmd, Command::Reject | Command::End);
    let res = match cmd {
        Command::Call(target) => {
            if target == machine.local_identity() {
                Err(CallError::InvalidState {
                    operation: "call",
                    state: "target is the local identity".into(),
                })
            } else {
                machine.start_call(&target).await.map(drop)
            }
        }
        Command::Accept => machine.accept().await,
        Command::Reject => machine.reject().await,
        Command::End => machine.end_call().await,
        Command::Status => {
            events.emit(CallEvent::Status(machine.snapshot()));
            Ok(())
        }
        Command::Quit => Ok(()),
    };
    match res {
        Ok(()) => {}
        Err(e @ CallError::InvalidState { .. }) => {
            events.emit(CallEvent::CommandRejected(e.to_string()))
        }
        Err(e @ CallError::DirectoryUnavailable(_)) if report_directory => {
            events.emit(CallEvent::CommandRejected(e.to_string()))
        }
        // setup failures were already reported as SetupFailed
        Err(e) => debug!("command failed: {e}"),
    }
}
