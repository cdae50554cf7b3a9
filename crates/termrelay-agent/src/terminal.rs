use std::collections::HashMap;
use std::io::{Read, Write};

use anyhow::{Context, anyhow};
use bytes::Bytes;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use termrelay_protocol::TerminalId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;
const READ_CHUNK: usize = 4096;

#[derive(Debug)]
pub enum TerminalEvent {
    Output { terminal_id: TerminalId, data: Bytes },
    Exited { terminal_id: TerminalId },
}

struct Terminal {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
}

/// The shells running on this host, keyed by broker-assigned terminal id.
pub struct Terminals {
    shell: String,
    terminals: HashMap<TerminalId, Terminal>,
    events: mpsc::Sender<TerminalEvent>,
}

impl Terminals {
    /// `events` receives output and exit notices from every shell. Its
    /// capacity bounds how far the readers run ahead of the connection.
    pub fn new(shell: impl Into<String>, events: mpsc::Sender<TerminalEvent>) -> Self {
        Self {
            shell: shell.into(),
            terminals: HashMap::new(),
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.terminals.len()
    }

    pub fn contains(&self, terminal_id: TerminalId) -> bool {
        self.terminals.contains_key(&terminal_id)
    }

    pub fn create(&mut self, terminal_id: TerminalId) -> anyhow::Result<()> {
        if self.terminals.contains_key(&terminal_id) {
            return Err(anyhow!("terminal {terminal_id} already exists"));
        }

        let pty_pair = native_pty_system()
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let mut cmd = CommandBuilder::new(&self.shell);
        if let Ok(home) = std::env::var("HOME") {
            cmd.cwd(home);
        }
        cmd.env("TERM", "xterm-256color");

        let child = pty_pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn {}", self.shell))?;
        // Only the master side stays open here
        drop(pty_pair.slave);

        let writer = pty_pair.master.take_writer().context("failed to take pty writer")?;
        let reader = pty_pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;

        let events = self.events.clone();
        std::thread::Builder::new()
            .name(format!("pty-reader-{terminal_id}"))
            .spawn(move || read_pty(terminal_id, reader, events))
            .context("failed to spawn pty reader thread")?;

        self.terminals.insert(
            terminal_id,
            Terminal {
                master: pty_pair.master,
                writer,
                child,
            },
        );
        info!(terminal_id, shell = %self.shell, "terminal created");
        Ok(())
    }

    pub fn write(&mut self, terminal_id: TerminalId, data: &[u8]) -> anyhow::Result<()> {
        let terminal = self
            .terminals
            .get_mut(&terminal_id)
            .ok_or_else(|| anyhow!("terminal not found: {terminal_id}"))?;
        terminal.writer.write_all(data)?;
        terminal.writer.flush()?;
        Ok(())
    }

    pub fn resize(
        &mut self,
        terminal_id: TerminalId,
        width: u16,
        height: u16,
    ) -> anyhow::Result<()> {
        let terminal = self
            .terminals
            .get(&terminal_id)
            .ok_or_else(|| anyhow!("terminal not found: {terminal_id}"))?;
        terminal.master.resize(PtySize {
            rows: height,
            cols: width,
            pixel_width: 0,
            pixel_height: 0,
        })?;
        Ok(())
    }

    /// Kill the shell and forget the terminal. Returns false if unknown.
    pub fn remove(&mut self, terminal_id: TerminalId) -> bool {
        let Some(mut terminal) = self.terminals.remove(&terminal_id) else {
            return false;
        };
        if let Err(e) = terminal.child.kill() {
            debug!(terminal_id, error = %e, "kill failed, shell probably exited");
        }
        let _ = terminal.child.try_wait();
        info!(terminal_id, "terminal removed");
        true
    }

    pub fn kill_all(&mut self) {
        let ids: Vec<TerminalId> = self.terminals.keys().copied().collect();
        for terminal_id in ids {
            self.remove(terminal_id);
        }
    }
}

impl Drop for Terminals {
    fn drop(&mut self) {
        self.kill_all();
    }
}

/// Blocking read loop for one pty, run on its own thread.
fn read_pty(
    terminal_id: TerminalId,
    mut reader: Box<dyn Read + Send>,
    events: mpsc::Sender<TerminalEvent>,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let event = TerminalEvent::Output {
                    terminal_id,
                    data: Bytes::copy_from_slice(&buf[..n]),
                };
                if events.blocking_send(event).is_err() {
                    // connection is gone
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO once the shell has exited
                debug!(terminal_id, error = %e, "pty read ended");
                break;
            }
        }
    }
    if events.blocking_send(TerminalEvent::Exited { terminal_id }).is_err() {
        warn!(terminal_id, "exit notice dropped");
    }
}
