use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::Registry;

/// Default sysfs GPIO root.
const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// Upper bound on one poll(2) call so the thread notices cancellation.
const POLL_TICK_MS: i32 = 500;

/// Capacity of the edge queue toward the engine. Edges are dropped (with a
/// warning) rather than stalling the capture thread when it fills up.
const EDGE_QUEUE_DEPTH: usize = 1024;

/// One observed edge on a monitored line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    /// Channel index of the line that pulsed.
    pub index: usize,
}

/// One monitored sysfs value descriptor.
#[derive(Debug)]
struct Line {
    index: usize,
    gpio: u32,
    file: File,
}

/// Edge-triggered pulse source backed by sysfs GPIO value files.
///
/// Edge waits run on a dedicated thread: poll(2) with POLLPRI on all value
/// descriptors, a dummy read to consume each notification, and one
/// `EdgeEvent` per consumed edge forwarded to the engine in index order.
#[derive(Debug)]
pub struct SysfsSource {
    lines: Vec<Line>,
}

/// Path of the sysfs value attribute for a pin.
fn value_path(root: &Path, gpio: u32) -> PathBuf {
    root.join(format!("gpio{gpio}/value"))
}

impl SysfsSource {
    /// Open the value descriptor of every configured channel under the
    /// standard sysfs root.
    pub fn open(registry: &Registry) -> Result<Self> {
        Self::open_at(Path::new(SYSFS_GPIO_ROOT), registry)
    }

    /// Open value descriptors under an explicit root directory.
    ///
    /// A channel whose descriptor cannot be opened is disabled for the
    /// process lifetime; only a fully empty wait set is fatal.
    pub fn open_at(root: &Path, registry: &Registry) -> Result<Self> {
        let mut lines = Vec::with_capacity(registry.len());

        for ch in registry.iter() {
            let path = value_path(root, ch.gpio);

            let mut file = match File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    error!(
                        channel = ch.index,
                        gpio = ch.gpio,
                        path = %path.display(),
                        error = %e,
                        "cannot open GPIO value, channel disabled",
                    );
                    continue;
                }
            };

            // Consume the current line state so the first poll only wakes
            // on a genuine transition.
            let mut buf = [0u8; 16];
            if let Err(e) = file.read(&mut buf) {
                warn!(channel = ch.index, gpio = ch.gpio, error = %e, "initial read failed");
            }

            lines.push(Line {
                index: ch.index,
                gpio: ch.gpio,
                file,
            });
        }

        if lines.is_empty() {
            bail!("no GPIO inputs could be opened");
        }

        Ok(Self { lines })
    }

    /// Number of channels with a live descriptor.
    pub fn active(&self) -> usize {
        self.lines.len()
    }

    /// Start the edge-wait thread and return the edge event receiver.
    ///
    /// The receiver is closed once the thread exits, which happens when the
    /// token is cancelled or every descriptor has died.
    pub fn start(self, cancel: CancellationToken) -> mpsc::Receiver<EdgeEvent> {
        let (tx, rx) = mpsc::channel(EDGE_QUEUE_DEPTH);

        std::thread::Builder::new()
            .name("gpio-poll".to_string())
            .spawn(move || poll_loop(self.lines, tx, cancel))
            .expect("spawning gpio poll thread");

        rx
    }
}

/// Blocking edge-wait loop. Owns the descriptors until exit.
fn poll_loop(mut lines: Vec<Line>, tx: mpsc::Sender<EdgeEvent>, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        if lines.is_empty() {
            error!("all GPIO descriptors failed, edge capture stopped");
            break;
        }

        let mut fds: Vec<libc::pollfd> = lines
            .iter()
            .map(|line| libc::pollfd {
                fd: line.file.as_raw_fd(),
                events: libc::POLLPRI,
                revents: 0,
            })
            .collect();

        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TICK_MS) };

        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            error!(error = %err, "poll failed");
            continue;
        }

        if ret == 0 {
            continue;
        }

        let mut dead = Vec::new();

        // Ready lines are serviced in channel-index order within one wake.
        for (slot, fd) in fds.iter().enumerate() {
            let revents = fd.revents;
            if revents == 0 {
                continue;
            }

            if revents & libc::POLLNVAL != 0 {
                error!(
                    channel = lines[slot].index,
                    gpio = lines[slot].gpio,
                    "descriptor invalid, channel disabled",
                );
                dead.push(slot);
                continue;
            }

            // Sysfs raises POLLPRI|POLLERR together on an attribute change,
            // so POLLERR here is part of a normal edge notification.
            match consume_edge(&mut lines[slot]) {
                Ok(true) => {
                    let event = EdgeEvent {
                        index: lines[slot].index,
                    };
                    match tx.try_send(event) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(channel = event.index, "edge queue full, dropping edge");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                    }
                }
                Ok(false) => {
                    // Zero-length read: spurious wakeup, nothing to count.
                    debug!(channel = lines[slot].index, "spurious wakeup");
                }
                Err(e) => {
                    warn!(
                        channel = lines[slot].index,
                        gpio = lines[slot].gpio,
                        error = %e,
                        "edge read failed",
                    );
                }
            }
        }

        for slot in dead.into_iter().rev() {
            lines.remove(slot);
        }
    }

    info!("gpio poll thread stopped");
}

/// Rewind and read the value attribute, consuming the pending notification.
/// Returns false on a zero-length read.
fn consume_edge(line: &mut Line) -> std::io::Result<bool> {
    line.file.seek(SeekFrom::Start(0))?;

    let mut buf = [0u8; 16];
    let n = line.file.read(&mut buf)?;

    Ok(n > 0)
}
