//! PTY-backed process launcher and screen reader.
//!
//! Each launched session gets a PTY, a reader thread feeding a vt100 parser
//! and a waiter thread reporting the exit status. The parser doubles as the
//! session's screen for attention scans.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tracing::{debug, warn};

use crate::collaborators::{LaunchRequest, ProcessHandle, ProcessLauncher, ScreenTextSource};
use crate::config::LaunchConfig;
use crate::registry::LifecycleSink;
use crate::session::SessionId;

type SharedParser = Arc<Mutex<vt100::Parser>>;

/// Launches the configured CLI in a PTY per session.
pub struct PtyLauncher {
    command: String,
    rows: u16,
    cols: u16,
    screens: Arc<Mutex<HashMap<SessionId, SharedParser>>>,
}

impl PtyLauncher {
    pub fn new(command: impl Into<String>, rows: u16, cols: u16) -> Self {
        Self {
            command: command.into(),
            rows,
            cols,
            screens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &LaunchConfig) -> Self {
        Self::new(config.command.clone(), config.rows, config.cols)
    }
}

impl ProcessLauncher for PtyLauncher {
    fn launch(&self, request: &LaunchRequest, sink: LifecycleSink) -> Result<Box<dyn ProcessHandle>> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: self.rows,
                cols: self.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&self.command);
        cmd.cwd(&request.working_dir);
        cmd.args(&request.args);

        // Set environment variables for better terminal experience
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn {}", self.command))?;
        // Only the child holds the slave end, so the reader sees EOF on exit.
        drop(pair.slave);

        let killer = child.clone_killer();
        let writer = pair.master.take_writer()?;
        let mut reader = pair.master.try_clone_reader()?;

        let parser: SharedParser = Arc::new(Mutex::new(vt100::Parser::new(self.rows, self.cols, 0)));
        lock(&self.screens).insert(request.session_id.clone(), Arc::clone(&parser));

        let output_sink = sink.clone();
        let screen = Arc::clone(&parser);
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        lock(&screen).process(&buf[..n]);
                        output_sink.output_received();
                    }
                }
            }
            debug!(session_id = %output_sink.session_id(), "PTY reader finished");
        });

        thread::spawn(move || {
            let exit_code = match child.wait() {
                Ok(status) => Some(i32::try_from(status.exit_code()).unwrap_or(i32::MAX)),
                Err(err) => {
                    warn!(session_id = %sink.session_id(), error = %err, "Failed to wait for child");
                    None
                }
            };
            sink.process_exited(exit_code);
        });

        debug!(
            session_id = %request.session_id,
            command = %self.command,
            cwd = %request.working_dir.display(),
            "Spawned PTY process"
        );

        Ok(Box::new(PtyProcess {
            session_id: request.session_id.clone(),
            _master: pair.master,
            writer,
            killer,
            parser,
            screens: Arc::clone(&self.screens),
        }))
    }
}

impl ScreenTextSource for PtyLauncher {
    fn visible_lines(&self, session_id: &str) -> Vec<String> {
        let Some(parser) = lock(&self.screens).get(session_id).cloned() else {
            return Vec::new();
        };
        let parser = lock(&parser);
        let screen = parser.screen();
        let (_, cols) = screen.size();
        screen
            .rows(0, cols)
            .map(|row| row.trim_end().to_string())
            .collect()
    }
}

/// A live PTY child.
struct PtyProcess {
    session_id: SessionId,
    _master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    parser: SharedParser,
    screens: Arc<Mutex<HashMap<SessionId, SharedParser>>>,
}

impl ProcessHandle for PtyProcess {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    fn terminate(&mut self) {
        if let Err(err) = self.killer.kill() {
            debug!(session_id = %self.session_id, error = %err, "Kill failed, process likely gone");
        }
    }
}

impl Drop for PtyProcess {
    /// Release the screen, whether the process was killed or exited by itself.
    fn drop(&mut self) {
        // A restart may already have installed a newer screen under this id.
        let mut screens = lock(&self.screens);
        if screens
            .get(&self.session_id)
            .is_some_and(|current| Arc::ptr_eq(current, &self.parser))
        {
            screens.remove(&self.session_id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
