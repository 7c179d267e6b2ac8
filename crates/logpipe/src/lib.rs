// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

//! A scoped, per-invocation pipe for capturing a child process's stdout and stderr as
//! `LogRecord`s and forwarding them to a caller-supplied sink.
//!
//! Two OS pipes are created; the write ends are handed to the child as its stdout/stderr, and
//! the read ends are each drained by a dedicated polling thread. The two readers communicate
//! with each other only through the sink callback and a single termination flag, matching the
//! concurrency model described for this component: no shared buffers, no cross-stream
//! synchronization beyond what the sink itself provides.

use std::io::{ErrorKind, Read};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use serde::{Deserialize, Serialize};

/// How often an idle reader wakes to check for new bytes or the termination signal.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Level {
    Trace,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Source {
    Bridge,
    UserStdout,
    UserStderr,
    Backend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: Level,
    pub source: Source,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(level: Level, source: Source, message: impl Into<String>) -> Self {
        LogRecord {
            level,
            source,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Receives `LogRecord`s as they are drained from a child's output streams.
///
/// Implementations may be called concurrently from the stdout and stderr reader threads, and
/// must therefore be `Send + Sync`. Ordering *within* a single stream is preserved; ordering
/// *across* the two streams is not, so a sink that mixes the two in a single destination (e.g.
/// a terminal) is responsible for its own interleaving-safety.
pub trait LogSink: Send + Sync {
    fn record(&self, record: LogRecord);
}

impl<F: Fn(LogRecord) + Send + Sync> LogSink for F {
    fn record(&self, record: LogRecord) {
        self(record)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LogPipeError {
    #[error("timed out waiting for log readers to drain within the grace period")]
    LogDrainTimeout,
}

/// The write ends of the pipe, to be wired up as the child's stdout/stderr.
pub struct LogPipeWriters {
    pub stdout: os_pipe::PipeWriter,
    pub stderr: os_pipe::PipeWriter,
}

/// Owns the two reader threads for one bridge session's worth of child output.
pub struct LogPipe {
    stdout_reader: Option<JoinHandle<()>>,
    stderr_reader: Option<JoinHandle<()>>,
    terminate: Arc<AtomicBool>,
}

impl LogPipe {
    /// Creates a new Log Pipe, spawning its two reader threads immediately. The returned
    /// `LogPipeWriters` must be handed to the child process as its stdout/stderr before the
    /// child is spawned, so that the write ends are inherited rather than closed.
    pub fn new(sink: Arc<dyn LogSink>) -> Result<(LogPipe, LogPipeWriters), std::io::Error> {
        let (stdout_reader, stdout_writer) = os_pipe::pipe()?;
        let (stderr_reader, stderr_writer) = os_pipe::pipe()?;
        let terminate = Arc::new(AtomicBool::new(false));

        let stdout_handle = spawn_reader(
            stdout_reader,
            Source::UserStdout,
            sink.clone(),
            terminate.clone(),
        )?;
        let stderr_handle = spawn_reader(stderr_reader, Source::UserStderr, sink, terminate.clone())?;

        Ok((
            LogPipe {
                stdout_reader: Some(stdout_handle),
                stderr_reader: Some(stderr_handle),
                terminate,
            },
            LogPipeWriters {
                stdout: stdout_writer,
                stderr: stderr_writer,
            },
        ))
    }

    /// Signals both readers that the child has exited and no further bytes are expected once
    /// the pipes reach EOF. Idempotent.
    pub fn signal_termination(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    /// Signals termination and synchronously waits for both readers to finish draining, bounded
    /// by `grace`. A timeout does not un-spawn the reader threads: they are left to finish in
    /// the background, and the caller is free to proceed since any result it already has is
    /// unaffected.
    pub fn join(self, grace: Duration) -> Result<(), LogPipeError> {
        self.signal_termination();
        let deadline = Instant::now() + grace;

        let mut timed_out = false;
        for handle in [self.stdout_reader, self.stderr_reader]
            .into_iter()
            .flatten()
        {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if wait_finished(&handle, remaining) {
                let _ = handle.join();
            } else {
                timed_out = true;
            }
        }

        if timed_out {
            Err(LogPipeError::LogDrainTimeout)
        } else {
            Ok(())
        }
    }
}

fn wait_finished(handle: &JoinHandle<()>, remaining: Duration) -> bool {
    let deadline = Instant::now() + remaining;
    loop {
        if handle.is_finished() {
            return true;
        }
        if Instant::now() >= deadline {
            return handle.is_finished();
        }
        thread::sleep(Duration::from_millis(10).min(remaining));
    }
}

fn set_nonblocking(reader: &os_pipe::PipeReader) -> Result<(), std::io::Error> {
    let fd = reader.as_raw_fd();
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(std::io::Error::from)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(std::io::Error::from)?;
    Ok(())
}

fn spawn_reader(
    mut reader: os_pipe::PipeReader,
    source: Source,
    sink: Arc<dyn LogSink>,
    terminate: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, std::io::Error> {
    set_nonblocking(&reader)?;
    Ok(thread::spawn(move || {
        let mut pending: Vec<u8> = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => drain_complete_lines(&mut pending, &buf[..n], source, &sink),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if terminate.load(Ordering::SeqCst) {
                        drain_to_eof(&mut reader, &mut pending, source, &sink);
                        break;
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        // Drain whatever's left without a trailing newline as a final record.
        if !pending.is_empty() {
            emit_line(&pending, source, &sink);
        }
    }))
}

/// Once termination has been signaled, makes one final pass draining whatever is immediately
/// available rather than continuing to poll indefinitely: a write end that outlives the child it
/// was handed to (e.g. a grandchild that inherited the fd) must not keep this thread alive
/// forever just because the pipe itself never reaches a true EOF.
fn drain_to_eof(
    reader: &mut os_pipe::PipeReader,
    pending: &mut Vec<u8>,
    source: Source,
    sink: &Arc<dyn LogSink>,
) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => drain_complete_lines(pending, &buf[..n], source, sink),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

/// Appends `chunk` to `pending`, emitting one record per complete line found, stripping each
/// line's trailing whitespace (not merely a single newline) before handing it to the sink.
fn drain_complete_lines(pending: &mut Vec<u8>, chunk: &[u8], source: Source, sink: &Arc<dyn LogSink>) {
    pending.extend_from_slice(chunk);
    loop {
        let Some(pos) = pending.iter().position(|&b| b == b'\n') else {
            break;
        };
        let line: Vec<u8> = pending.drain(..=pos).collect();
        emit_line(&line, source, sink);
    }
}

fn emit_line(line: &[u8], source: Source, sink: &Arc<dyn LogSink>) {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim_end();
    sink.record(LogRecord::new(Level::Info, source, trimmed.to_owned()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Write;

    struct CollectingSink {
        records: Mutex<Vec<LogRecord>>,
    }

    impl LogSink for CollectingSink {
        fn record(&self, record: LogRecord) {
            self.records.lock().push(record);
        }
    }

    #[test]
    fn drains_complete_and_trailing_partial_lines() {
        let sink = Arc::new(CollectingSink {
            records: Mutex::new(Vec::new()),
        });
        let (pipe, mut writers) = LogPipe::new(sink.clone()).expect("should create pipe");

        writers
            .stdout
            .write_all(b"first line\nsecond line\npartial")
            .unwrap();
        drop(writers.stdout);
        writers.stderr.write_all(b"err line\n").unwrap();
        drop(writers.stderr);

        pipe.join(Duration::from_secs(5)).expect("should not time out");

        let records = sink.records.lock();
        let stdout_messages: Vec<&str> = records
            .iter()
            .filter(|r| matches!(r.source, Source::UserStdout))
            .map(|r| r.message.as_str())
            .collect();
        assert_eq!(stdout_messages, vec!["first line", "second line", "partial"]);

        let stderr_messages: Vec<&str> = records
            .iter()
            .filter(|r| matches!(r.source, Source::UserStderr))
            .map(|r| r.message.as_str())
            .collect();
        assert_eq!(stderr_messages, vec!["err line"]);
    }

    #[test]
    fn strips_trailing_whitespace_not_just_newline() {
        let sink = Arc::new(CollectingSink {
            records: Mutex::new(Vec::new()),
        });
        let (pipe, mut writers) = LogPipe::new(sink.clone()).expect("should create pipe");
        writers.stdout.write_all(b"padded   \r\n").unwrap();
        drop(writers.stdout);
        drop(writers.stderr);

        pipe.join(Duration::from_secs(5)).expect("should not time out");

        let records = sink.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "padded");
    }
}
