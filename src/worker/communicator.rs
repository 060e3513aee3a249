//! Outbound message channel of a worker process.
//!
//! `put` marks the channel busy while a line is being written. A termination
//! request that arrives while idle aborts the worker at once; one that
//! arrives mid-send is honoured right after the line is complete, so the
//! scheduler never reads half a message.

use std::io::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::MessageError;
use crate::messaging::Message;

/// Exit status used when a worker aborts on request (128 + SIGTERM).
pub const TERMINATED_EXIT_CODE: i32 = 143;

#[derive(Debug, Default)]
struct Flags {
    sending: bool,
    terminate_requested: bool,
}

type AbortFn = Box<dyn Fn() + Send + Sync>;

/// Thread-safe handle around a worker's outbound channel.
pub struct WorkerCommunicator {
    sink: Mutex<Box<dyn Write + Send>>,
    flags: Mutex<Flags>,
    abort: AbortFn,
}

impl WorkerCommunicator {
    /// Communicator writing to `sink`; aborting exits the process.
    pub fn new(sink: impl Write + Send + 'static) -> Self {
        Self {
            sink: Mutex::new(Box::new(sink)),
            flags: Mutex::new(Flags::default()),
            abort: Box::new(|| {
                tracing::warn!("Termination requested, worker exiting");
                std::process::exit(TERMINATED_EXIT_CODE)
            }),
        }
    }

    /// Communicator on the process's stdout.
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Replace what happens on abort.
    pub fn with_abort(mut self, abort: impl Fn() + Send + Sync + 'static) -> Self {
        self.abort = Box::new(abort);
        self
    }

    /// Send one message.
    pub fn put(&self, message: &Message) -> Result<(), MessageError> {
        let line = message.to_line()?;

        {
            let mut flags = self.flags();
            if flags.terminate_requested {
                drop(flags);
                return self.abort_now();
            }
            flags.sending = true;
        }

        let written = self.write_line(&line);

        let terminate = {
            let mut flags = self.flags();
            flags.sending = false;
            flags.terminate_requested
        };
        if terminate {
            return self.abort_now();
        }
        written
    }

    /// Ask the worker to stop. Called from the SIGTERM listener.
    pub fn request_termination(&self) {
        let idle = {
            let mut flags = self.flags();
            flags.terminate_requested = true;
            !flags.sending
        };
        if idle {
            (self.abort)();
        }
    }

    pub fn termination_requested(&self) -> bool {
        self.flags().terminate_requested
    }

    fn write_line(&self, line: &str) -> Result<(), MessageError> {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        sink.write_all(line.as_bytes())?;
        sink.write_all(b"\n")?;
        sink.flush()?;
        Ok(())
    }

    fn abort_now(&self) -> Result<(), MessageError> {
        (self.abort)();
        Err(MessageError::Terminated)
    }

    fn flags(&self) -> MutexGuard<'_, Flags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
