//! The OS-level half of a shell session: one child process on a
//! pseudoterminal, plus a reader thread forwarding its output.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc::{self, Receiver};
use tracing::{debug, error};

use crate::error::{Error, Result};

// Channel buffer sizes
const PTY_OUTPUT_BUFFER: usize = 1024;
const PTY_READ_BUFFER: usize = 16384;

pub type ChildHandle = Arc<Mutex<Box<dyn Child + Send + Sync>>>;

/// Owns the pty master, its writer and the child process.
pub struct PtyProcess {
    writer: Box<dyn Write + Send>,
    // kept so the master side stays open for the session's lifetime
    _master: Box<dyn MasterPty + Send>,
    child: ChildHandle,
    pid: Option<u32>,
    /// Flipped by the reader thread once the pty hits EOF.
    exited: Arc<AtomicBool>,
}

impl PtyProcess {
    /// Spawns `cmd` on a fresh pty.
    ///
    /// # Returns
    /// The process and the receiver of everything it prints. The receiver
    /// yields `None` once the child side of the pty is gone.
    pub fn spawn(cmd: CommandBuilder) -> Result<(Self, Receiver<Vec<u8>>)> {
        let pty_system = native_pty_system();

        // wide enough that nothing we send gets wrapped
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 4096,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::Connection(format!("cannot allocate a pty: {}", e)))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| Error::Connection(format!("cannot spawn shell: {}", e)))?;

        // Drop slave side in parent process
        drop(pair.slave);

        let pid = child.process_id();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| Error::Connection(format!("cannot read from pty: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| Error::Connection(format!("cannot write to pty: {}", e)))?;

        let exited = Arc::new(AtomicBool::new(false));
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(PTY_OUTPUT_BUFFER);

        let exited_flag = exited.clone();
        std::thread::spawn(move || {
            let mut reader = reader;
            let mut buf = [0u8; PTY_READ_BUFFER];

            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        debug!("pty of pid {:?} reached EOF", pid);
                        break;
                    }
                    Ok(n) => {
                        // Use blocking_send since we're in a std::thread
                        if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            // Receiver dropped, session is gone
                            break;
                        }
                    }
                    Err(e) => {
                        if e.kind() == std::io::ErrorKind::Interrupted {
                            continue;
                        }
                        // EIO is how Linux reports a closed slave side
                        if e.raw_os_error() != Some(5) {
                            error!("PTY read error for pid {:?}: {}", pid, e);
                        }
                        break;
                    }
                }
            }
            exited_flag.store(true, Ordering::SeqCst);
        });

        Ok((
            Self {
                writer,
                _master: pair.master,
                child: Arc::new(Mutex::new(child)),
                pid,
                exited,
            },
            output_rx,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn child(&self) -> ChildHandle {
        self.child.clone()
    }

    pub fn exited_flag(&self) -> Arc<AtomicBool> {
        self.exited.clone()
    }

    pub fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }
}

/// Non-blocking liveness probe.
pub fn child_running(child: &ChildHandle) -> bool {
    match child.lock() {
        Ok(mut child) => matches!(child.try_wait(), Ok(None)),
        Err(_) => false,
    }
}

pub fn kill_child(child: &ChildHandle) {
    if let Ok(mut child) = child.lock() {
        if matches!(child.try_wait(), Ok(None)) {
            if let Err(e) = child.kill() {
                debug!("kill of pty child failed: {}", e);
            }
        }
        // reap
        if let Err(e) = child.try_wait() {
            debug!("reaping pty child failed: {}", e);
        }
    }
}
