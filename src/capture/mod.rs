// CaptureSupervisor: owns the capture subprocess for one session
//
// Spawns the configured capture tool bound to the session directory, tees
// its output into the session log artifact and the broker's log/packet
// streams, and finalizes artifacts exactly once after the process is gone.
// Artifacts on disk belong to this module until finalized; afterwards they
// are read-only everywhere.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, watch};

use crate::api::{epoch_ms, Artifact, ArtifactKind, Session};
use crate::config::CaptureConfig;
use crate::error::SessionError;
use crate::process::{ExitReport, ProcessSpec, ToolHandle, ToolRunner};
use crate::stream::StreamBroker;

const PCAP_FILE: &str = "capture.pcap";
const LOG_FILE: &str = "capture.log";

/// Live capture state for one session
pub struct CaptureHandle {
    session_id: u64,
    tool: ToolHandle,
    pcap_path: PathBuf,
    log_path: PathBuf,
    /// Resolves when the log writer has flushed and closed the file
    writer_done: Option<oneshot::Receiver<()>>,
    finalized: Mutex<Option<Vec<Artifact>>>,
}

impl CaptureHandle {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Watch receiver resolving when the subprocess exits.
    pub fn exit_receiver(&self) -> watch::Receiver<Option<ExitReport>> {
        self.tool.exit_receiver()
    }
}

/// Spawns and supervises capture subprocesses
pub struct CaptureSupervisor {
    config: CaptureConfig,
    runner: ToolRunner,
    broker: Arc<StreamBroker>,
    artifact_seq: AtomicU64,
}

impl CaptureSupervisor {
    pub fn new(config: CaptureConfig, broker: Arc<StreamBroker>) -> Self {
        let runner = ToolRunner::new(
            Duration::from_millis(config.grace_period_ms),
            config.stderr_tail_lines,
        );
        Self {
            config,
            runner,
            broker,
            artifact_seq: AtomicU64::new(0),
        }
    }

    /// Spawn the capture tool for a session.
    ///
    /// The tool writes its pcap into the session directory; its merged
    /// output is forwarded line by line to the broker and appended to the
    /// session log artifact. Spawn failure is fatal to session start.
    pub async fn start_capture(&self, session: &Session) -> Result<CaptureHandle, SessionError> {
        let session_dir = PathBuf::from(&session.session_dir);
        let pcap_path = session_dir.join(PCAP_FILE);
        let log_path = session_dir.join(LOG_FILE);

        let log_file = tokio::fs::File::create(&log_path).await.map_err(|err| {
            SessionError::Io {
                context: format!("creating {}: {}", log_path.display(), err),
            }
        })?;

        let mut args = self.config.args.clone();
        args.push(self.config.pcap_flag.clone());
        args.push(pcap_path.to_string_lossy().into_owned());

        let spec = ProcessSpec {
            id: format!("capture-{}", session.id),
            command: self.config.command.clone(),
            args,
            working_dir: Some(session_dir),
            env: Vec::new(),
        };

        let mut tool = self.runner.spawn(spec).map_err(|err| {
            SessionError::SpawnFailure {
                reason: err.to_string(),
            }
        })?;
        log::info!(
            "[CaptureSupervisor] Capture started for session {} (pid {:?})",
            session.id,
            tool.pid()
        );

        let (done_tx, done_rx) = oneshot::channel();
        let mut lines = tool.take_lines().expect("fresh tool handle");
        let broker = Arc::clone(&self.broker);
        let marker = self.config.packet_marker.clone();
        let session_id = session.id;

        tokio::spawn(async move {
            let mut writer = tokio::io::BufWriter::new(log_file);
            let mut write_failed = false;

            while let Some(line) = lines.recv().await {
                let stamp = format_clock(epoch_ms());
                let formatted = if line.from_stderr {
                    format!("[{}] ERROR: {}", stamp, line.text)
                } else {
                    format!("[{}] {}", stamp, line.text)
                };
                broker.publish_log(session_id, formatted);

                if !line.from_stderr {
                    if let Some(packet) = line.text.strip_prefix(&marker) {
                        broker.publish_packet(session_id, packet.to_string());
                    }
                }

                if !write_failed {
                    let record = format!("{}\n", line.text);
                    if let Err(err) = writer.write_all(record.as_bytes()).await {
                        log::error!(
                            "[CaptureSupervisor] Log write failed for session {}: {}",
                            session_id,
                            err
                        );
                        write_failed = true;
                    }
                }
            }

            if let Err(err) = writer.flush().await {
                log::error!(
                    "[CaptureSupervisor] Log flush failed for session {}: {}",
                    session_id,
                    err
                );
            }
            drop(writer);
            let _ = done_tx.send(());
        });

        Ok(CaptureHandle {
            session_id: session.id,
            tool,
            pcap_path,
            log_path,
            writer_done: Some(done_rx),
            finalized: Mutex::new(None),
        })
    }

    /// Gracefully terminate the capture and finalize its artifacts.
    pub async fn stop_capture(&self, handle: &mut CaptureHandle) -> (ExitReport, Vec<Artifact>) {
        let report = handle.tool.stop_and_wait().await;
        let artifacts = self.finalize_artifacts(handle).await;
        (report, artifacts)
    }

    /// Record artifacts exactly once, after the log writer has closed.
    ///
    /// Later calls return the same records. Files the tool never produced
    /// are simply not recorded.
    pub async fn finalize_artifacts(&self, handle: &mut CaptureHandle) -> Vec<Artifact> {
        if let Some(existing) = handle.finalized.lock().expect("finalize poisoned").clone() {
            return existing;
        }

        if let Some(done) = handle.writer_done.take() {
            // Bounded: the writer ends at pipe EOF, which the exit implies.
            let _ = tokio::time::timeout(Duration::from_secs(5), done).await;
        }

        let mut artifacts = Vec::new();
        for (kind, path) in [
            (ArtifactKind::Pcap, &handle.pcap_path),
            (ArtifactKind::DiagLog, &handle.log_path),
        ] {
            match tokio::fs::metadata(path).await {
                Ok(meta) => artifacts.push(Artifact {
                    id: self.artifact_seq.fetch_add(1, Ordering::SeqCst) + 1,
                    session_id: handle.session_id,
                    kind,
                    path: path.to_string_lossy().into_owned(),
                    size_bytes: meta.len(),
                }),
                Err(_) => log::warn!(
                    "[CaptureSupervisor] No {:?} artifact at {} for session {}",
                    kind,
                    path.display(),
                    handle.session_id
                ),
            }
        }

        *handle.finalized.lock().expect("finalize poisoned") = Some(artifacts.clone());
        log::info!(
            "[CaptureSupervisor] Finalized {} artifacts for session {}",
            artifacts.len(),
            handle.session_id
        );
        artifacts
    }
}

/// Wall-clock "[HH:MM:SS.mmm]" fragment (UTC) for log line prefixes.
fn format_clock(ms: u64) -> String {
    let secs_of_day = (ms / 1_000) % 86_400;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        secs_of_day / 3_600,
        (secs_of_day / 60) % 60,
        secs_of_day % 60,
        ms % 1_000
    )
}
