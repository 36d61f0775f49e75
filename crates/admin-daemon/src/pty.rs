//! Interactive shell attached to a session.
//!
//! The shell runs with piped stdio. Everything it prints is pushed to the
//! session as `term` messages; input arrives through `pty {msg}`. Terminal
//! size is passed to the shell through `COLUMNS`/`LINES` and recorded on
//! resize.

use admin_core::protocol::messages::{NewTerm, PtyRequest, names};
use admin_core::session::{AttachedProcess, SessionRegistry, short};
use admin_core::transport::Transport;
use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

fn shell() -> Command {
    if cfg!(windows) {
        Command::new("powershell.exe")
    } else {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string());
        Command::new(shell)
    }
}

pub struct ShellProcess {
    child: Child,
    input: mpsc::UnboundedSender<String>,
    cols: u16,
    rows: u16,
}

impl ShellProcess {
    /// Spawn a shell whose output is pushed to `output`.
    pub fn spawn(output: Transport, cols: u16, rows: u16) -> Result<Self> {
        let mut child = shell()
            .env("COLUMNS", cols.to_string())
            .env("LINES", rows.to_string())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn shell")?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, output));
        }

        let (input, mut input_rx) = mpsc::unbounded_channel::<String>();
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(data) = input_rx.recv().await {
                    if stdin.write_all(data.as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdin.flush().await;
                }
            });
        }

        Ok(Self {
            child,
            input,
            cols,
            rows,
        })
    }

    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, output: Transport) {
    let mut buffer = vec![0u8; 8192];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buffer[..n]).into_owned();
                if output.send_json(names::TERM, &text).is_err() {
                    break;
                }
            }
        }
    }
}

impl AttachedProcess for ShellProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn write(&self, input: &str) -> bool {
        self.input.send(input.to_string()).is_ok()
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("Shell already gone: {}", e);
        }
    }
}

/// Handle a `pty` request for `session`.
pub fn handle(
    sessions: &SessionRegistry,
    session: &str,
    connection: &Transport,
    request: PtyRequest,
) -> Result<()> {
    if request.start {
        let cols = request.cols.unwrap_or(DEFAULT_COLS);
        let rows = request.rows.unwrap_or(DEFAULT_ROWS);
        let process = ShellProcess::spawn(connection.clone(), cols, rows)?;
        let pid = process.pid();
        sessions.attach_process(session, Box::new(process))?;
        debug!("Session {} started shell {:?} ({}x{})", short(session), pid, cols, rows);
        connection.send_json(names::NEW_TERM, &NewTerm { pid })?;
    }

    if request.resize {
        if let (Some(cols), Some(rows)) = (request.cols, request.rows) {
            sessions.with_process(session, |process| process.resize(cols, rows));
        }
    }

    if let Some(msg) = request.msg {
        let delivered = sessions
            .with_process(session, |process| process.write(&msg))
            .unwrap_or(false);
        if !delivered {
            debug!("Session {} has no running shell for input", short(session));
        }
    }

    Ok(())
}
