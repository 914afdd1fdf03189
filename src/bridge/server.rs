//! # Bridge server
//!
//! The worker-process side of the bridge: a [`Controller`] driven by the
//! command protocol over a pair of byte pipes (stdin/stdout when spawned
//! with `--server`).
//!
//! The loop waits on two events — a command became readable, or the
//! running job finished — and services them one at a time. Completion is
//! pushed to the client as an unsolicited `STATE_CHANGED` frame; commands
//! are read and answered synchronously. Any error is final: the server
//! sends `ERROR` and exits, and the client respawns a fresh process.

use std::io::{Read, Write};
use std::sync::mpsc;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::bridge::notify::ReadNotifier;
use crate::bridge::protocol::{self, WireOptions, WireSettings};
use crate::controller::Controller;
use crate::error::EngineError;

enum ServerEvent {
    CommandReady,
    RunFinished,
}

/// Serve the command protocol over the given byte streams until the
/// client shuts us down or the stream dies.
pub fn serve<R, W>(input: R, mut output: W) -> Result<(), EngineError>
where
    R: Read + Send + 'static,
    W: Write,
{
    info!("worker: starting");
    let (events_tx, events) = mpsc::channel::<ServerEvent>();

    let notifier = {
        let tx = events_tx.clone();
        ReadNotifier::spawn(
            input,
            Some(Arc::new(move || {
                let _ = tx.send(ServerEvent::CommandReady);
            })),
        )
    };

    let mut controller = Controller::new();
    {
        let tx = events_tx;
        controller.set_finished_callback(move || {
            let _ = tx.send(ServerEvent::RunFinished);
        });
    }

    let mut shutdown = false;
    while !shutdown {
        notifier.arm();
        let event = match events.recv() {
            Ok(event) => event,
            Err(_) => break,
        };

        match event {
            ServerEvent::RunFinished => {
                debug!("worker: sending STATE_CHANGED");
                protocol::write_state_changed(&mut output).map_err(protocol::write_failed)?;
                output.flush().map_err(protocol::write_failed)?;
                continue;
            }
            ServerEvent::CommandReady => {}
        }

        let mut reader = notifier.timed_reader(None, None);
        let command = match protocol::read_raw_i32(&mut reader) {
            Ok(command) => command,
            Err(e) => {
                // EOF here means the client went away; nothing to report
                // to anyone.
                info!("worker: command channel closed ({})", e);
                break;
            }
        };
        if command != protocol::CMD_GET_STATE {
            debug!("worker: got command {}", command);
        }

        // A pending run error is fatal: report it instead of the command
        // and stop. The front-end tears us down regardless.
        if let Some(err) = controller.error() {
            warn!("worker: responding with error: {}", err);
            protocol::write_error(&mut output, &err.to_string())
                .map_err(protocol::write_failed)?;
            output.flush().map_err(protocol::write_failed)?;
            controller.abort();
            break;
        }

        match command {
            protocol::CMD_START => {
                controller.abort();

                let settings: WireSettings =
                    protocol::read_record(&mut reader).map_err(protocol::read_failed)?;
                let options: WireOptions =
                    protocol::read_record(&mut reader).map_err(protocol::read_failed)?;
                let image = protocol::read_image_raw(&mut reader)?;
                let mask = protocol::read_image_raw(&mut reader)?;
                info!("worker: got image data: {}x{}", image.width(), image.height());

                controller.settings = settings.to_settings();
                controller.options = options.to_options();
                controller.set_target(image);
                controller.set_mask(mask);

                protocol::write_ok(&mut output, command).map_err(protocol::write_failed)?;

                if let Err(err) = controller.run() {
                    warn!("worker: run failed: {}", err);
                    protocol::write_error(&mut output, &err.to_string())
                        .map_err(protocol::write_failed)?;
                    output.flush().map_err(protocol::write_failed)?;
                    break;
                }
            }

            protocol::CMD_GET_STATE => {
                let finished = controller.finished();
                let progress = controller.progress();
                protocol::write_ok(&mut output, command).map_err(protocol::write_failed)?;
                protocol::write_frame(&mut output, &[finished as u8])
                    .map_err(protocol::write_failed)?;
                protocol::write_frame(&mut output, &progress.to_le_bytes())
                    .map_err(protocol::write_failed)?;
            }

            protocol::CMD_GET_RESULT => {
                if !controller.finished() {
                    warn!("worker: GET_RESULT while still working");
                    protocol::write_error(&mut output, "received GET_RESULT while still working")
                        .map_err(protocol::write_failed)?;
                    output.flush().map_err(protocol::write_failed)?;
                    break;
                }
                protocol::write_ok(&mut output, command).map_err(protocol::write_failed)?;
                controller
                    .with_result(|img| protocol::write_frame(&mut output, img.bytes()))?
                    .map_err(protocol::write_failed)?;
            }

            protocol::CMD_RESET => {
                controller.abort();
                protocol::write_ok(&mut output, command).map_err(protocol::write_failed)?;
            }

            protocol::CMD_SHUTDOWN => {
                controller.abort();
                shutdown = true;
                protocol::write_ok(&mut output, command).map_err(protocol::write_failed)?;
            }

            other => {
                protocol::write_error(&mut output, &format!("unknown command {}", other))
                    .map_err(protocol::write_failed)?;
                output.flush().map_err(protocol::write_failed)?;
                break;
            }
        }
        output.flush().map_err(protocol::write_failed)?;
    }

    info!("worker: shutting down");
    Ok(())
}

/// Entry point for `--server`: the inherited stdin/stdout are the command
/// channel; diagnostics go to stderr through the logger.
pub fn run_server() -> Result<(), EngineError> {
    serve(std::io::stdin(), std::io::stdout())
}
