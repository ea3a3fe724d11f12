//! Vendor flashing tools
//!
//! The vendor tools are run as subprocesses. Whether an invocation
//! succeeded is decided by looking for known marker strings in the combined
//! output of the tool, never by the exit status alone: some tools exit with
//! zero after failing and others exit non-zero after a benign condition.
//! Each adapter module documents the markers it relies on.

use std::{
    io::{self, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::error::{Error, Stage, Transport};

pub mod esptool;
pub mod jlink;
pub mod stm32;
pub mod uniflash;

/// How long a tool may try to connect before the operator is prompted
pub const CONNECT_STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of classifying the output of a tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Success,
    /// The operation succeeded but the operator has to act
    SuccessWithWarning(String),
    Failure(String),
}

impl ToolOutcome {
    /// Turn a failure into an error of the given transport and stage,
    /// logging any warning
    pub fn into_result(self, transport: Transport, stage: Stage) -> Result<(), Error> {
        match self {
            ToolOutcome::Success => Ok(()),
            ToolOutcome::SuccessWithWarning(reason) => {
                warn!("{reason}");
                Ok(())
            }
            ToolOutcome::Failure(message) => Err(Error::ToolFailed {
                transport,
                stage,
                message,
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, ToolOutcome::Failure(_))
    }
}

/// A single tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Watch the output for a stalled connection attempt
    pub watch_connect: bool,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            watch_connect: false,
        }
    }

    pub fn watch_connect(mut self) -> Self {
        self.watch_connect = true;
        self
    }
}

/// Captured result of a finished tool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit status, `None` when the tool was killed by a signal
    pub status: Option<i32>,
    /// Standard output followed by standard error
    pub text: String,
}

impl ToolOutput {
    pub fn new(status: i32, text: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            text: text.into(),
        }
    }

    pub fn contains(&self, marker: &str) -> bool {
        self.text.contains(marker)
    }

    /// First output line containing `needle`, trimmed
    pub fn line_with(&self, needle: &str) -> Option<&str> {
        self.text
            .lines()
            .find(|l| l.contains(needle))
            .map(str::trim)
    }

    /// Short description of what went wrong, for error messages
    pub fn failure_summary(&self) -> String {
        self.text
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| {
                let lower = l.to_lowercase();
                lower.contains("error") || lower.contains("failed")
            })
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| match self.status {
                Some(code) => format!("tool exited with status {code}"),
                None => "tool was terminated".to_owned(),
            })
    }
}

/// Runs tool invocations, waiting for them to exit
pub trait ToolRunner {
    fn run(&self, invocation: &Invocation) -> io::Result<ToolOutput>;
}

impl<T: ToolRunner + ?Sized> ToolRunner for &T {
    fn run(&self, invocation: &Invocation) -> io::Result<ToolOutput> {
        (**self).run(invocation)
    }
}

/// [ToolRunner] spawning real processes
pub struct ProcessRunner {
    on_connect_stall: Box<dyn Fn() + Send + Sync>,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(|| warn!("Still connecting, hold the BOOT button of the device"))
    }
}

impl ProcessRunner {
    /// `on_connect_stall` is called once per invocation when a watched tool
    /// has been trying to connect for longer than [CONNECT_STALL_TIMEOUT]
    pub fn new(on_connect_stall: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            on_connect_stall: Box::new(on_connect_stall),
        }
    }
}

impl ToolRunner for ProcessRunner {
    fn run(&self, invocation: &Invocation) -> io::Result<ToolOutput> {
        debug!(
            "Running {} {}",
            invocation.program.display(),
            invocation.args.join(" ")
        );

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })
        });

        let mut raw = Vec::new();
        if let Some(mut stdout) = child.stdout.take() {
            let mut watch = invocation
                .watch_connect
                .then(|| StallWatch::new(CONNECT_STALL_TIMEOUT));
            let mut chunk = [0u8; 256];

            loop {
                let read = stdout.read(&mut chunk)?;
                if read == 0 {
                    break;
                }
                raw.extend_from_slice(&chunk[..read]);

                if let Some(watch) = &mut watch {
                    if watch.observe(&chunk[..read], Instant::now()) {
                        (self.on_connect_stall)();
                    }
                }
            }
        }

        let status = child.wait()?;
        let mut text = String::from_utf8_lossy(&raw).into_owned();

        if let Some(stderr) = stderr.and_then(|h| h.join().ok()) {
            text.push_str(&stderr);
        }

        debug!("{} exited with {status}", invocation.program.display());
        debug!("{text}");

        Ok(ToolOutput {
            status: status.code(),
            text,
        })
    }
}

const CONNECTING: &[u8] = b"Connecting";
const ANSWERS: &[&[u8]] = &[b"Chip is", b"Detecting chip"];
/// Bytes carried over between chunks, enough for a marker split in two
const MARKER_OVERLAP: usize = 13;

/// Detects a tool stuck trying to connect to a device
#[derive(Debug)]
struct StallWatch {
    timeout: Duration,
    connecting_since: Option<Instant>,
    answered: bool,
    fired: bool,
    window: Vec<u8>,
}

impl StallWatch {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            connecting_since: None,
            answered: false,
            fired: false,
            window: Vec::new(),
        }
    }

    /// Feed the next chunk of output. Returns `true` exactly once, when the
    /// output has shown a connection attempt for longer than the timeout
    /// without the chip answering.
    fn observe(&mut self, chunk: &[u8], now: Instant) -> bool {
        if self.fired {
            return false;
        }

        self.window.extend_from_slice(chunk);

        // only answers after the latest attempt count
        if let Some(start) = rfind(&self.window, CONNECTING) {
            self.connecting_since.get_or_insert(now);
            self.answered = false;
            self.window.drain(..start + CONNECTING.len());
        }
        if ANSWERS.iter().any(|a| rfind(&self.window, a).is_some()) {
            self.answered = true;
        }

        let carried = self.window.len().saturating_sub(MARKER_OVERLAP);
        self.window.drain(..carried);

        let Some(since) = self.connecting_since else {
            return false;
        };

        if !self.answered && now.duration_since(since) > self.timeout {
            self.fired = true;
            return true;
        }

        false
    }
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Reject paths the J-Link tools can't open: spaces or anything but ASCII
pub fn is_tool_safe_path(path: &Path) -> bool {
    path.to_str()
        .is_some_and(|p| p.is_ascii() && !p.contains(' '))
}
