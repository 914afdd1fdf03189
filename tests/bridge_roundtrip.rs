//! Bridge protocol tests: the server loop over in-memory pipes, and the
//! full client/worker-process round trip against the real binary.

mod common;

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use aniso::bridge::client::RemoteEngine;
use aniso::bridge::protocol::{self, WireOptions, WireSettings};
use aniso::bridge::server;
use aniso::controller::Controller;
use aniso::Options;
use common::*;

/// Blocking reader over an mpsc channel of byte chunks; EOF when the
/// sender hangs up.
struct ChanReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

impl Read for ChanReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending.extend(chunk),
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        for b in buf[..n].iter_mut() {
            *b = self.pending.pop_front().unwrap();
        }
        Ok(n)
    }
}

struct ChanWriter(mpsc::Sender<Vec<u8>>);

impl Write for ChanWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "server reader gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An in-memory server plus the client's half of the pipes.
struct Harness {
    to_server: mpsc::Sender<Vec<u8>>,
    from_server: ChanReader,
    thread: Option<std::thread::JoinHandle<Result<(), aniso::EngineError>>>,
}

impl Harness {
    fn start() -> Self {
        let (to_server, server_rx) = mpsc::channel();
        let (server_tx, from_client_rx) = mpsc::channel();
        let thread = std::thread::spawn(move || {
            server::serve(
                ChanReader { rx: server_rx, pending: VecDeque::new() },
                ChanWriter(server_tx),
            )
        });
        Self {
            to_server,
            from_server: ChanReader { rx: from_client_rx, pending: VecDeque::new() },
            thread: Some(thread),
        }
    }

    fn send(&self, bytes: Vec<u8>) {
        self.to_server.send(bytes).expect("server hung up");
    }

    /// Skip unsolicited STATE_CHANGED frames and insist on OK for the
    /// given command, exactly as the real client does.
    fn expect_ok(&mut self, command: i32) {
        loop {
            let code = protocol::read_frame_i32(&mut self.from_server).unwrap();
            match code {
                protocol::RESP_STATE_CHANGED => continue,
                protocol::RESP_OK => {
                    let echo = protocol::read_frame_i32(&mut self.from_server).unwrap();
                    assert_eq!(echo, command);
                    return;
                }
                protocol::RESP_ERROR => {
                    let msg = protocol::read_frame_var(&mut self.from_server).unwrap();
                    panic!("server error: {}", String::from_utf8_lossy(&msg));
                }
                other => panic!("unexpected response code {}", other),
            }
        }
    }

    /// Poll GET_STATE until the server reports completion.
    fn wait_finished(&mut self) -> f32 {
        let deadline = Instant::now() + Duration::from_secs(120);
        loop {
            assert!(Instant::now() < deadline, "server never finished");
            let mut cmd = Vec::new();
            protocol::write_raw_i32(&mut cmd, protocol::CMD_GET_STATE).unwrap();
            self.send(cmd);
            self.expect_ok(protocol::CMD_GET_STATE);
            let finished = protocol::read_frame_bool(&mut self.from_server).unwrap();
            let progress = protocol::read_frame_f32(&mut self.from_server).unwrap();
            assert!((0.0..=1.0).contains(&progress));
            if finished {
                return progress;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn shutdown(mut self) {
        let mut cmd = Vec::new();
        protocol::write_raw_i32(&mut cmd, protocol::CMD_SHUTDOWN).unwrap();
        self.send(cmd);
        self.expect_ok(protocol::CMD_SHUTDOWN);
        self.thread.take().unwrap().join().unwrap().unwrap();
    }
}

fn start_payload(settings: &aniso::Settings, image: &aniso_pix::IntImage) -> Vec<u8> {
    let mut payload = Vec::new();
    protocol::write_raw_i32(&mut payload, protocol::CMD_START).unwrap();
    protocol::write_record(&mut payload, &WireSettings::from(settings)).unwrap();
    protocol::write_record(&mut payload, &WireOptions::from(&Options::default())).unwrap();
    protocol::write_image_raw(&mut payload, image).unwrap();
    protocol::write_no_image_raw(&mut payload).unwrap();
    payload
}

/// The server loop end-to-end over in-memory pipes: START, poll, fetch,
/// shut down; the result matches an in-process run byte for byte.
#[test]
fn server_loop_round_trip_matches_in_process() {
    let image = noise_image(48, 48, 3, 42);
    let settings = s2_settings();

    let mut engine = Controller::new();
    engine.settings = settings;
    let reference = run_and_fetch(&mut engine, image.clone());

    let mut harness = Harness::start();
    harness.send(start_payload(&settings, &image));
    harness.expect_ok(protocol::CMD_START);

    let progress = harness.wait_finished();
    assert_eq!(progress, 1.0);

    let mut cmd = Vec::new();
    protocol::write_raw_i32(&mut cmd, protocol::CMD_GET_RESULT).unwrap();
    harness.send(cmd);
    harness.expect_ok(protocol::CMD_GET_RESULT);
    let mut pixels = vec![0u8; reference.len()];
    protocol::read_frame_exact(&mut harness.from_server, &mut pixels).unwrap();
    assert_eq!(pixels, reference);

    harness.shutdown();
}

/// RESET mid-run returns the server to idle, and a new START still
/// works.
#[test]
fn server_reset_aborts_and_recovers() {
    let image = noise_image(300, 300, 3, 17);
    let settings = s2_settings();

    let mut harness = Harness::start();
    harness.send(start_payload(&settings, &image));
    harness.expect_ok(protocol::CMD_START);

    let mut cmd = Vec::new();
    protocol::write_raw_i32(&mut cmd, protocol::CMD_RESET).unwrap();
    harness.send(cmd);
    harness.expect_ok(protocol::CMD_RESET);

    // A fresh, smaller job still runs to completion.
    let small = noise_image(32, 32, 3, 4);
    harness.send(start_payload(&settings, &small));
    harness.expect_ok(protocol::CMD_START);
    harness.wait_finished();
    harness.shutdown();
}

/// GET_RESULT before completion is a fatal protocol error: the server
/// answers ERROR and exits.
#[test]
fn premature_get_result_is_fatal() {
    let image = noise_image(400, 400, 3, 23);
    let mut harness = Harness::start();
    harness.send(start_payload(&s2_settings(), &image));
    harness.expect_ok(protocol::CMD_START);

    let mut cmd = Vec::new();
    protocol::write_raw_i32(&mut cmd, protocol::CMD_GET_RESULT).unwrap();
    harness.send(cmd);

    let code = protocol::read_frame_i32(&mut harness.from_server).unwrap();
    assert_eq!(code, protocol::RESP_ERROR);
    let msg = protocol::read_frame_var(&mut harness.from_server).unwrap();
    assert!(String::from_utf8_lossy(&msg).contains("still working"));
    harness.thread.take().unwrap().join().unwrap().unwrap();
}

/// S5 against the real worker binary: the bridge result equals the
/// in-process result byte for byte.
#[test]
fn s5_worker_process_round_trip() {
    let image = noise_image(100, 100, 3, 42);
    let settings = s2_settings();

    let mut engine = Controller::new();
    engine.settings = settings;
    let reference = run_and_fetch(&mut engine, image.clone());

    let mut remote = RemoteEngine::new(env!("CARGO_BIN_EXE_anisod"));
    remote.settings = settings;
    remote.set_io_timeout(Duration::from_secs(10));
    remote.set_target(image);
    remote.run();

    let deadline = Instant::now() + Duration::from_secs(120);
    while !remote.finished() {
        assert!(Instant::now() < deadline, "worker never finished");
        std::thread::sleep(Duration::from_millis(10));
        remote.update_state();
    }
    remote.finalize();
    assert!(remote.error().is_none());

    let result = remote.take_result().expect("bridge kept the image");
    assert_eq!(result.bytes(), reference.as_slice());

    remote.shutdown();
}

/// The client respawns a worker that was shut down between runs.
#[test]
fn client_respawns_after_shutdown() {
    let image = noise_image(32, 32, 3, 6);
    let settings = s2_settings();

    let mut remote = RemoteEngine::new(env!("CARGO_BIN_EXE_anisod"));
    remote.settings = settings;
    remote.set_io_timeout(Duration::from_secs(10));
    remote.set_target(image.clone());
    remote.run();
    let deadline = Instant::now() + Duration::from_secs(60);
    while !remote.finished() {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(10));
        remote.update_state();
    }
    remote.finalize();
    assert!(remote.error().is_none());
    remote.shutdown();

    // Second run after an explicit shutdown: lazy respawn.
    remote.set_target(image);
    remote.run();
    let deadline = Instant::now() + Duration::from_secs(60);
    while !remote.finished() {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(10));
        remote.update_state();
    }
    assert!(remote.error().is_none());
    remote.shutdown();
}
