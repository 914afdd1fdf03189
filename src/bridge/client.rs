//! # Bridge client
//!
//! Mostly the same surface as [`Controller`](crate::controller::Controller),
//! with the work moved into a helper process.
//!
//! Running out-of-process sidesteps the ugliest host constraints: a host
//! whose allocator is not thread-safe cannot be trusted under a threaded
//! filter, and any instability in a GPU driver stays contained in a
//! process we can respawn. The cost is that the worker cannot use memory
//! the host has already claimed, plus a copy of the image over the pipe
//! in each direction.
//!
//! Error handling uses the lazy checking model: the first failure parks
//! an error and every further operation is a no-op until [`RemoteEngine::error`]
//! consumes it (which also tears the worker process down). Only
//! operations whose results matter check explicitly.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aniso_pix::IntImage;
use log::{debug, info, warn};

use crate::bridge::notify::{PipeWriter, ReadNotifier};
use crate::bridge::protocol::{self, WireOptions, WireSettings};
use crate::config::{Options, Settings};
use crate::error::EngineError;

/// Host hooks: UI wake-ups and the retry prompt on I/O timeouts.
pub trait BridgeCallbacks: Send + Sync {
    /// Unsolicited news from the worker; issue
    /// [`RemoteEngine::update_state`] soon.
    fn state_changed(&self) {}

    /// An I/O operation timed out. Return `true` to keep waiting.
    fn retry_io(&self) -> bool {
        false
    }
}

/// The do-nothing callback set.
pub struct NullCallbacks;

impl BridgeCallbacks for NullCallbacks {}

const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Out-of-process engine front-end. See the module docs.
pub struct RemoteEngine {
    pub settings: Settings,
    pub options: Options,

    worker_path: PathBuf,
    io_timeout: Duration,
    shutdown_timeout: Duration,
    callbacks: Arc<dyn BridgeCallbacks>,

    source: Option<IntImage>,
    mask: Option<IntImage>,

    child: Option<Child>,
    writer: Option<PipeWriter>,
    notifier: Option<ReadNotifier>,

    finished: bool,
    progress: f32,
    error: Option<EngineError>,
}

impl RemoteEngine {
    /// A bridge that will spawn `worker_path --server` on first use.
    pub fn new(worker_path: impl Into<PathBuf>) -> Self {
        Self {
            settings: Settings::default(),
            options: Options::default(),
            worker_path: worker_path.into(),
            io_timeout: DEFAULT_IO_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            callbacks: Arc::new(NullCallbacks),
            source: None,
            mask: None,
            child: None,
            writer: None,
            notifier: None,
            finished: false,
            progress: 0.0,
            error: None,
        }
    }

    /// Use the running binary itself as the worker.
    pub fn from_current_exe() -> Result<Self, EngineError> {
        let path = std::env::current_exe()
            .map_err(|e| EngineError::Worker(format!("cannot locate own binary: {}", e)))?;
        Ok(Self::new(path))
    }

    pub fn set_callbacks(&mut self, callbacks: Arc<dyn BridgeCallbacks>) {
        self.callbacks = callbacks;
    }

    pub fn set_io_timeout(&mut self, timeout: Duration) {
        self.io_timeout = timeout;
    }

    pub fn set_target(&mut self, image: IntImage) {
        self.source = Some(image);
    }

    pub fn set_mask(&mut self, mask: IntImage) {
        self.mask = Some(mask);
    }

    /// The (processed, after [`Self::finalize`]) image.
    pub fn result(&self) -> Option<&IntImage> {
        self.source.as_ref()
    }

    pub fn take_result(&mut self) -> Option<IntImage> {
        self.source.take()
    }

    /// Ship the inputs to the worker process (spawning or respawning it
    /// as needed) and start processing. Asynchronous; poll with
    /// [`Self::update_state`].
    pub fn run(&mut self) {
        if !self.init() {
            return;
        }

        debug!("writing START");
        let mut payload = Vec::new();
        let built = (|| -> std::io::Result<()> {
            protocol::write_raw_i32(&mut payload, protocol::CMD_START)?;
            protocol::write_record(&mut payload, &WireSettings::from(&self.settings))?;
            protocol::write_record(&mut payload, &WireOptions::from(&self.options))?;
            match &self.source {
                Some(img) => protocol::write_image_raw(&mut payload, img)?,
                None => protocol::write_no_image_raw(&mut payload)?,
            }
            match &self.mask {
                Some(mask) => protocol::write_image_raw(&mut payload, mask)?,
                None => protocol::write_no_image_raw(&mut payload)?,
            }
            Ok(())
        })();
        if let Err(e) = built {
            self.error = Some(protocol::write_failed(e));
            return;
        }

        if !self.send(&payload) {
            return;
        }
        self.wait_for_response(protocol::CMD_START);
        self.update_state();
    }

    /// Refresh `finished`/`progress` from the worker and re-arm the
    /// readiness notifier.
    pub fn update_state(&mut self) {
        if self.child.is_none() {
            return;
        }
        if self.send_command(protocol::CMD_GET_STATE)
            && self.wait_for_response(protocol::CMD_GET_STATE)
        {
            if let Some(finished) = self.read_with(|r| protocol::read_frame_bool(r)) {
                self.finished = finished;
            }
            if let Some(progress) = self.read_with(|r| protocol::read_frame_f32(r)) {
                self.progress = progress;
            }
        }

        if self.error.is_some() {
            self.finished = false;
            self.progress = 0.0;
            return;
        }

        // Notifications were implicitly paused while we exchanged
        // request/response traffic; listen again now.
        if let Some(notifier) = &self.notifier {
            notifier.arm();
        }
    }

    /// True once processing ended — successfully or by error; check
    /// [`Self::error`] before trusting the result.
    pub fn finished(&self) -> bool {
        self.finished || self.error.is_some()
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    /// Consuming read of the pending error. A pending error also means
    /// the worker process is dead weight; it is torn down here.
    pub fn error(&mut self) -> Option<EngineError> {
        self.error.as_ref()?;
        // Leave the error in place through shutdown so it takes the
        // kill path instead of a doomed graceful exchange.
        self.shutdown();
        self.error.take()
    }

    /// Fetch the processed pixels into the held source image, then reset
    /// the worker to idle. Only valid once finished.
    pub fn finalize(&mut self) {
        debug!("writing GET_RESULT");
        if !(self.send_command(protocol::CMD_GET_RESULT)
            && self.wait_for_response(protocol::CMD_GET_RESULT))
        {
            return;
        }

        let Some(mut img) = self.source.take() else {
            self.error =
                Some(EngineError::Validation("no target image to finalize into".to_string()));
            return;
        };
        let expected = img.stride_bytes() * img.height();
        if let Some(data) = self.read_with(|r| {
            let mut buf = vec![0u8; expected];
            protocol::read_frame_exact(r, &mut buf)?;
            Ok(buf)
        }) {
            img.bytes_mut().copy_from_slice(&data);
        }
        self.source = Some(img);

        self.abort();
    }

    /// Abort any running job; the worker returns to idle.
    pub fn abort(&mut self) {
        if self.child.is_none() {
            return;
        }
        debug!("writing RESET");
        if self.send_command(protocol::CMD_RESET) {
            self.wait_for_response(protocol::CMD_RESET);
        }
    }

    /// Stop the worker process: gracefully when healthy, by force when
    /// not (or when graceful takes too long).
    pub fn shutdown(&mut self) {
        self.abort();

        if self.child.is_some() && self.error.is_none() {
            debug!("writing SHUTDOWN");
            if self.send_command(protocol::CMD_SHUTDOWN) {
                self.wait_for_response(protocol::CMD_SHUTDOWN);
            }
            if self.error.is_none() {
                let deadline = Instant::now() + self.shutdown_timeout;
                while Instant::now() < deadline {
                    match self.child.as_mut().map(|c| c.try_wait()) {
                        Some(Ok(Some(_))) => {
                            self.child = None;
                            break;
                        }
                        Some(Ok(None)) => std::thread::sleep(Duration::from_millis(20)),
                        _ => break,
                    }
                }
            }
        }

        // Whatever is left gets the axe.
        if let Some(mut child) = self.child.take() {
            if !matches!(child.try_wait(), Ok(Some(_))) {
                warn!("worker process would not exit cleanly; killing it");
                let _ = child.kill();
            }
            let _ = child.wait();
        }

        if let Some(writer) = &mut self.writer {
            writer.close();
        }
        self.writer = None;
        self.notifier = None;
    }

    /// Ensure a live worker process, spawning or respawning as needed.
    /// On failure the error is parked and `false` returned.
    fn init(&mut self) -> bool {
        if self.error.is_some() {
            return false;
        }

        if let Some(child) = self.child.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return true;
            }
            // It died while idle; nothing was interrupted, so clean up
            // and start fresh. The parked error makes shutdown skip the
            // graceful path.
            warn!("worker process exited unexpectedly; restarting");
            self.error = Some(EngineError::Worker("worker process exited unexpectedly".into()));
            self.shutdown();
            self.error = None;
        }

        info!("spawning worker process {}", self.worker_path.display());
        let spawned = Command::new(&self.worker_path)
            .arg("--server")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.error = Some(EngineError::Worker(format!(
                    "failed to spawn worker process {}: {}",
                    self.worker_path.display(),
                    e
                )));
                return false;
            }
        };

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            self.error = Some(EngineError::Worker("worker pipes not available".to_string()));
            let _ = child.kill();
            return false;
        };

        self.writer = Some(PipeWriter::spawn(stdin));
        let callbacks = Arc::clone(&self.callbacks);
        self.notifier = Some(ReadNotifier::spawn(
            stdout,
            Some(Arc::new(move || callbacks.state_changed())),
        ));
        self.child = Some(child);
        self.finished = false;
        self.progress = 0.0;
        true
    }

    fn send_command(&mut self, command: i32) -> bool {
        self.send(&command.to_le_bytes())
    }

    /// Raw write with timeout and the retry hook; parks errors. Every
    /// exchange starts here, so this is also where notifications pause
    /// until the response has been consumed.
    fn send(&mut self, bytes: &[u8]) -> bool {
        if self.error.is_some() {
            return false;
        }
        if let Some(notifier) = &self.notifier {
            notifier.disarm();
        }
        let result = {
            let Some(writer) = &self.writer else {
                self.error =
                    Some(EngineError::Worker("worker process is not running".to_string()));
                return false;
            };
            let callbacks = Arc::clone(&self.callbacks);
            let retry = move || callbacks.retry_io();
            writer.write_timed(bytes, self.io_timeout, Some(&retry))
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                self.error = Some(protocol::write_failed(e));
                false
            }
        }
    }

    /// Framed read with timeout and the retry hook; parks errors.
    fn read_with<T>(
        &mut self,
        f: impl FnOnce(&mut dyn std::io::Read) -> Result<T, EngineError>,
    ) -> Option<T> {
        if self.error.is_some() {
            return None;
        }
        let result = {
            let Some(notifier) = &self.notifier else {
                self.error =
                    Some(EngineError::Worker("worker process is not running".to_string()));
                return None;
            };
            let callbacks = Arc::clone(&self.callbacks);
            let retry = move || callbacks.retry_io();
            let mut reader = notifier.timed_reader(Some(self.io_timeout), Some(&retry));
            f(&mut reader)
        };
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.error = Some(e);
                None
            }
        }
    }

    /// Consume frames until the answer to `command` arrives. Unsolicited
    /// `STATE_CHANGED` frames in between are discarded; the worker
    /// re-raises them the next time it has news.
    fn wait_for_response(&mut self, command: i32) -> bool {
        loop {
            let Some(code) = self.read_with(|r| protocol::read_frame_i32(r)) else {
                return false;
            };

            match code {
                protocol::RESP_STATE_CHANGED => {
                    debug!("got STATE_CHANGED while awaiting response");
                    continue;
                }
                protocol::RESP_ERROR => {
                    let message = self
                        .read_with(|r| protocol::read_frame_var(r))
                        .map(|m| String::from_utf8_lossy(&m).into_owned())
                        .unwrap_or_else(|| "unreadable error message".to_string());
                    warn!("error from worker process: {}", message);
                    self.error =
                        Some(EngineError::Worker(format!("error from process: {}", message)));
                    // All errors are fatal to the worker; take it down.
                    self.shutdown();
                    return false;
                }
                protocol::RESP_OK => {
                    let Some(echo) = self.read_with(|r| protocol::read_frame_i32(r)) else {
                        return false;
                    };
                    if echo != command {
                        self.error = Some(EngineError::Protocol(format!(
                            "response for command {} while awaiting {}",
                            echo, command
                        )));
                        self.shutdown();
                        return false;
                    }
                    return true;
                }
                other => {
                    self.error =
                        Some(EngineError::Protocol(format!("unexpected response code {}", other)));
                    self.shutdown();
                    return false;
                }
            }
        }
    }
}

impl Drop for RemoteEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
