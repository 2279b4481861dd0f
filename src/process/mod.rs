// External tool runner: spawn, stream, and terminate capture subprocesses
//
// The orchestration core never touches tokio::process directly; it goes
// through ToolRunner, which returns a handle exposing the child's merged
// output as a line sequence and its termination as a watch notification.
// The child is supervised by exit futures, never by a thread parked in a
// blocking wait.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

/// Description of a subprocess to spawn
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Identifier used in logs (e.g. "capture-12")
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// One line of subprocess output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub text: String,
    pub from_stderr: bool,
}

/// Terminal status of a supervised subprocess
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code; None when the process died to a signal
    pub code: Option<i32>,
    pub success: bool,
    /// Whether termination was requested through the handle
    pub requested: bool,
    /// Trailing stderr lines for failure diagnostics
    pub stderr_tail: Vec<String>,
}

/// Live handle to a spawned subprocess
pub struct ToolHandle {
    id: String,
    pid: Option<u32>,
    lines: Option<mpsc::Receiver<OutputLine>>,
    exit_rx: watch::Receiver<Option<ExitReport>>,
    term_tx: mpsc::Sender<()>,
}

impl ToolHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the output line receiver. Single consumer; subsequent calls
    /// return None.
    pub fn take_lines(&mut self) -> Option<mpsc::Receiver<OutputLine>> {
        self.lines.take()
    }

    /// Watch receiver resolving to Some(report) when the process exits.
    pub fn exit_receiver(&self) -> watch::Receiver<Option<ExitReport>> {
        self.exit_rx.clone()
    }

    /// Request graceful termination. Safe to call more than once.
    pub fn request_stop(&self) {
        let _ = self.term_tx.try_send(());
    }

    /// Await the exit report, requesting termination first.
    pub async fn stop_and_wait(&mut self) -> ExitReport {
        self.request_stop();
        self.wait_for_exit().await
    }

    /// Await the exit report without requesting termination.
    pub async fn wait_for_exit(&mut self) -> ExitReport {
        loop {
            if let Some(report) = self.exit_rx.borrow().clone() {
                return report;
            }
            if self.exit_rx.changed().await.is_err() {
                // Supervision task gone without publishing; treat as failed.
                return ExitReport {
                    code: None,
                    success: false,
                    requested: false,
                    stderr_tail: Vec::new(),
                };
            }
        }
    }
}

/// Spawns and supervises external tools
#[derive(Debug, Clone)]
pub struct ToolRunner {
    grace_period: Duration,
    stderr_tail_lines: usize,
}

impl ToolRunner {
    pub fn new(grace_period: Duration, stderr_tail_lines: usize) -> Self {
        Self {
            grace_period,
            stderr_tail_lines,
        }
    }

    /// Spawn the subprocess described by `spec`.
    ///
    /// Spawn failure is returned synchronously; once this returns Ok the
    /// process is running and supervised.
    pub fn spawn(&self, spec: ProcessSpec) -> std::io::Result<ToolHandle> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn()?;
        let pid = child.id();
        log::info!("[ToolRunner] Started {} (pid {:?})", spec.id, pid);

        let (line_tx, line_rx) = mpsc::channel::<OutputLine>(1_024);
        let (exit_tx, exit_rx) = watch::channel::<Option<ExitReport>>(None);
        let (term_tx, mut term_rx) = mpsc::channel::<()>(1);

        let stderr_tail = Arc::new(Mutex::new(VecDeque::<String>::new()));
        let tail_cap = self.stderr_tail_lines;

        let stdout_task = child.stdout.take().map(|stdout| {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(text)) = lines.next_line().await {
                    // Keep draining even without a consumer so the pipe
                    // never backs up into the child.
                    let _ = tx
                        .send(OutputLine {
                            text,
                            from_stderr: false,
                        })
                        .await;
                }
            })
        });

        let stderr_task = child.stderr.take().map(|stderr| {
            let tx = line_tx;
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(text)) = lines.next_line().await {
                    {
                        let mut tail = tail.lock().expect("stderr tail poisoned");
                        if tail.len() >= tail_cap {
                            tail.pop_front();
                        }
                        tail.push_back(text.clone());
                    }
                    let _ = tx
                        .send(OutputLine {
                            text,
                            from_stderr: true,
                        })
                        .await;
                }
            })
        });

        let grace = self.grace_period;
        let spec_id = spec.id.clone();
        tokio::spawn(async move {
            // Resolve the race outside the select so the wait future is
            // dropped before the termination path re-borrows the child.
            let exited_first = tokio::select! {
                status = child.wait() => Some(status),
                _ = term_rx.recv() => None,
            };
            let (status, requested) = match exited_first {
                Some(status) => (status, false),
                None => terminate_gracefully(&mut child, pid, grace, &spec_id).await,
            };

            let (code, success) = match status {
                Ok(status) => (status.code(), status.success()),
                Err(err) => {
                    log::error!("[ToolRunner] Waiting on {} failed: {}", spec_id, err);
                    (None, false)
                }
            };

            // Readers finish at pipe EOF; join them so the report carries
            // the complete stderr tail.
            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            if let Some(task) = stderr_task {
                let _ = task.await;
            }

            let tail = stderr_tail
                .lock()
                .expect("stderr tail poisoned")
                .iter()
                .cloned()
                .collect();
            log::info!(
                "[ToolRunner] {} exited (code {:?}, requested {})",
                spec_id,
                code,
                requested
            );
            let _ = exit_tx.send(Some(ExitReport {
                code,
                success,
                requested,
                stderr_tail: tail,
            }));
        });

        Ok(ToolHandle {
            id: spec.id,
            pid,
            lines: Some(line_rx),
            exit_rx,
            term_tx,
        })
    }
}

/// SIGTERM, bounded grace period, then SIGKILL.
async fn terminate_gracefully(
    child: &mut tokio::process::Child,
    pid: Option<u32>,
    grace: Duration,
    spec_id: &str,
) -> (std::io::Result<std::process::ExitStatus>, bool) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            // SAFETY: signalling a pid we spawned and still own.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => (status, true),
        Err(_) => {
            log::warn!(
                "[ToolRunner] {} ignored SIGTERM for {:?}, escalating to kill",
                spec_id,
                grace
            );
            let _ = child.start_kill();
            (child.wait().await, true)
        }
    }
}
