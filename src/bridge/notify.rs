//! # Pipe readiness notifier and timed pipe I/O
//!
//! Pipes cannot be polled portably from synchronous code, so each end of
//! the bridge runs a small background thread per direction:
//!
//! - [`ReadNotifier`] owns the read end. It drains the pipe into a
//!   buffer and, while *armed*, fires a one-shot callback the moment data
//!   (or EOF) is available — that is how unsolicited `STATE_CHANGED`
//!   traffic wakes the client without a read being outstanding. Reads go
//!   through [`TimedReader`], which waits on the same buffer with a
//!   deadline; data consumed this way never triggers the callback.
//! - [`PipeWriter`] owns the write end. Writes are handed to the thread
//!   and acknowledged back, so the caller can give up after a timeout
//!   even though the underlying `write` cannot be interrupted.
//!
//! The notifier thread exits when its pipe reaches EOF; it is detached
//! rather than joined, because a blocking pipe read cannot be cancelled
//! portably and EOF arrives as soon as the peer goes away.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::trace;

/// Readiness callback; fired from the reader thread while disarmed.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

struct BufState {
    buf: VecDeque<u8>,
    eof: bool,
    armed: bool,
}

struct Shared {
    state: Mutex<BufState>,
    cond: Condvar,
    callback: Option<Callback>,
}

impl Shared {
    /// Fire the callback outside the lock; `armed` was already cleared.
    fn notify_ready(&self) {
        if let Some(cb) = &self.callback {
            trace!("read notification fired");
            cb();
        }
    }
}

/// Background reader with one-shot readiness callbacks. See the module
/// docs.
pub struct ReadNotifier {
    shared: Arc<Shared>,
}

impl ReadNotifier {
    /// Start draining `source`. `callback` fires once per [`Self::arm`]
    /// when data or EOF is ready; it must not call back into the
    /// notifier.
    pub fn spawn<R: Read + Send + 'static>(mut source: R, callback: Option<Callback>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(BufState { buf: VecDeque::new(), eof: false, armed: false }),
            cond: Condvar::new(),
            callback,
        });

        let thread_shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("aniso-pipe-reader".to_string())
            .spawn(move || {
                let mut chunk = [0u8; 16 * 1024];
                loop {
                    match source.read(&mut chunk) {
                        Ok(0) | Err(_) => {
                            let fire = {
                                let mut st = thread_shared.state.lock().unwrap();
                                st.eof = true;
                                thread_shared.cond.notify_all();
                                std::mem::take(&mut st.armed)
                            };
                            if fire {
                                thread_shared.notify_ready();
                            }
                            break;
                        }
                        Ok(n) => {
                            let fire = {
                                let mut st = thread_shared.state.lock().unwrap();
                                st.buf.extend(&chunk[..n]);
                                thread_shared.cond.notify_all();
                                std::mem::take(&mut st.armed)
                            };
                            if fire {
                                thread_shared.notify_ready();
                            }
                        }
                    }
                }
            })
            .expect("spawning the pipe reader");

        Self { shared }
    }

    /// Begin waiting for data. If some is already buffered (or the pipe
    /// is closed) the callback fires immediately; otherwise it fires once
    /// when the next bytes arrive, then deactivates until re-armed.
    pub fn arm(&self) {
        let ready = {
            let mut st = self.shared.state.lock().unwrap();
            if !st.buf.is_empty() || st.eof {
                true
            } else {
                st.armed = true;
                false
            }
        };
        if ready {
            self.shared.notify_ready();
        }
    }

    /// Disarm without firing; used while a request/response exchange is
    /// in flight.
    pub fn disarm(&self) {
        self.shared.state.lock().unwrap().armed = false;
    }

    /// Wait up to `timeout` (forever when `None`) for at least one byte,
    /// then move as much as fits into `buf`. Data read this way never
    /// fires the callback. `Ok(0)` means EOF.
    fn read_some(&self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.shared.state.lock().unwrap();
        loop {
            if !st.buf.is_empty() {
                let n = buf.len().min(st.buf.len());
                for b in buf[..n].iter_mut() {
                    *b = st.buf.pop_front().unwrap();
                }
                return Ok(n);
            }
            if st.eof {
                return Ok(0);
            }
            match deadline {
                None => st = self.shared.cond.wait(st).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "pipe read timed out"));
                    }
                    let (guard, _) = self.shared.cond.wait_timeout(st, deadline - now).unwrap();
                    st = guard;
                }
            }
        }
    }

    /// Reader over the buffered pipe with a per-read timeout and an
    /// optional retry hook consulted on each timeout.
    pub fn timed_reader<'a>(
        &'a self,
        timeout: Option<Duration>,
        retry: Option<&'a dyn Fn() -> bool>,
    ) -> TimedReader<'a> {
        TimedReader { notifier: self, timeout, retry }
    }
}

/// `io::Read` adapter over a [`ReadNotifier`]. Each underlying wait is
/// bounded by the timeout; a timeout consults the retry hook and either
/// keeps waiting or surfaces `TimedOut`.
pub struct TimedReader<'a> {
    notifier: &'a ReadNotifier,
    timeout: Option<Duration>,
    retry: Option<&'a dyn Fn() -> bool>,
}

impl Read for TimedReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.notifier.read_some(buf, self.timeout) {
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    if let Some(retry) = self.retry {
                        if retry() {
                            continue;
                        }
                    }
                    return Err(e);
                }
                other => return other,
            }
        }
    }
}

/// Background writer with acknowledged, timeout-bounded writes.
pub struct PipeWriter {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    ack: mpsc::Receiver<io::Result<()>>,
}

impl PipeWriter {
    pub fn spawn<W: Write + Send + 'static>(mut sink: W) -> Self {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let (ack_tx, ack) = mpsc::channel::<io::Result<()>>();

        std::thread::Builder::new()
            .name("aniso-pipe-writer".to_string())
            .spawn(move || {
                for buf in rx {
                    let result = sink.write_all(&buf).and_then(|_| sink.flush());
                    if ack_tx.send(result).is_err() {
                        break;
                    }
                }
            })
            .expect("spawning the pipe writer");

        Self { tx: Some(tx), ack }
    }

    /// Queue `bytes` and wait for the write to complete. A timeout
    /// consults `retry`; giving up leaves the write in flight (it cannot
    /// be cancelled) and surfaces `TimedOut`.
    pub fn write_timed(
        &self,
        bytes: &[u8],
        timeout: Duration,
        retry: Option<&dyn Fn() -> bool>,
    ) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "writer closed"))?;
        tx.send(bytes.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe writer gone"))?;
        loop {
            match self.ack.recv_timeout(timeout) {
                Ok(result) => return result,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if let Some(retry) = retry {
                        if retry() {
                            continue;
                        }
                    }
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "pipe write timed out"));
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe writer gone"));
                }
            }
        }
    }

    /// Close the write end; the thread drains and exits.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A reader that yields one chunk after a delay, then blocks until
    /// dropped data arrives.
    struct SlowChunks {
        chunks: Vec<(Duration, Vec<u8>)>,
    }

    impl Read for SlowChunks {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.chunks.is_empty() {
                return Ok(0);
            }
            let (delay, chunk) = self.chunks.remove(0);
            std::thread::sleep(delay);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn armed_callback_fires_once_per_arm() {
        let fired = Arc::new(AtomicUsize::new(0));
        let cb_fired = Arc::clone(&fired);
        let notifier = ReadNotifier::spawn(
            SlowChunks {
                chunks: vec![(Duration::from_millis(30), vec![1, 2, 3])],
            },
            Some(Arc::new(move || {
                cb_fired.fetch_add(1, Ordering::SeqCst);
            })),
        );
        notifier.arm();
        std::thread::sleep(Duration::from_millis(120));
        // One fire for the chunk (or the chunk+EOF race may fire on the
        // immediate re-arm below, but never without arming).
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Data is already buffered: arming again fires immediately.
        notifier.arm();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn timed_read_sees_buffered_bytes_and_eof() {
        let notifier = ReadNotifier::spawn(
            SlowChunks { chunks: vec![(Duration::from_millis(5), vec![9, 8, 7])] },
            None,
        );
        let mut reader = notifier.timed_reader(Some(Duration::from_secs(2)), None);
        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [9, 8, 7]);
        // Next read hits EOF.
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn read_timeout_expires() {
        struct Never;
        impl Read for Never {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                std::thread::sleep(Duration::from_secs(3600));
                Ok(0)
            }
        }
        let notifier = ReadNotifier::spawn(Never, None);
        let mut reader = notifier.timed_reader(Some(Duration::from_millis(30)), None);
        let mut buf = [0u8; 1];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn pipe_writer_roundtrip_and_close() {
        let (tx, rx) = mpsc::channel::<u8>();
        struct ChanSink(mpsc::Sender<u8>);
        impl Write for ChanSink {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                for &b in buf {
                    let _ = self.0.send(b);
                }
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut writer = PipeWriter::spawn(ChanSink(tx));
        writer.write_timed(&[1, 2, 3], Duration::from_secs(1), None).unwrap();
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        writer.close();
        assert!(writer.write_timed(&[4], Duration::from_secs(1), None).is_err());
    }
}
