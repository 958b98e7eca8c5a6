//! External point-cloud engine, run as a child process

use log::{debug, warn};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::Result;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
/// How long stderr may stay open once the engine has exited or been killed
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// How an engine run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutcome {
    /// The process exited; `code` is `None` when it was killed by a signal
    Exited {
        code: Option<i32>,
        diagnostics: String,
    },
    /// The wall-clock limit was reached and the process killed
    TimedOut { diagnostics: String },
}

/// Runs a pipeline file
///
/// Only the exit status, the diagnostic text and the output file named by
/// the pipeline's writer are relied upon.
pub trait Engine: Send + Sync {
    fn name(&self) -> &str {
        "engine"
    }

    fn run(&self, pipeline_file: &Path, timeout: Duration) -> Result<EngineOutcome>;
}

/// `pdal pipeline <file>`
#[derive(Debug, Clone)]
pub struct PdalEngine {
    program: PathBuf,
}

impl PdalEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        PdalEngine {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Default for PdalEngine {
    fn default() -> Self {
        PdalEngine::new("pdal")
    }
}

impl Engine for PdalEngine {
    fn name(&self) -> &str {
        "pdal"
    }

    fn run(&self, pipeline_file: &Path, timeout: Duration) -> Result<EngineOutcome> {
        debug!("{:?} pipeline {:?}", self.program, pipeline_file);
        let mut command = Command::new(&self.program);
        command
            .arg("pipeline")
            .arg(pipeline_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        // Own process group, so wrapper scripts die with their engine
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);
        let mut child = command.spawn()?;

        // Drained on its own thread so a chatty engine cannot block on a full pipe
        let stderr = child.stderr.take();
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let mut bytes = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut bytes);
            }
            let _ = sender.send(String::from_utf8_lossy(&bytes).into_owned());
        });

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if Instant::now() >= deadline {
                warn!(
                    "{:?} exceeded {timeout:?} on {:?}, killing it",
                    self.program, pipeline_file
                );
                kill_tree(&mut child);
                break None;
            }
            thread::sleep(POLL_INTERVAL);
        };
        let diagnostics = receiver.recv_timeout(DRAIN_GRACE).unwrap_or_else(|_| {
            warn!(
                "stderr of {:?} still open after exit, diagnostics dropped",
                self.program
            );
            String::new()
        });

        Ok(match status {
            Some(status) => EngineOutcome::Exited {
                code: status.code(),
                diagnostics,
            },
            None => EngineOutcome::TimedOut { diagnostics },
        })
    }
}

/// Kill the child and, on unix, every process of its group
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        match Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => debug!("kill {group} exited with {status}"),
            Err(e) => warn!("failed to signal process group {group}: {e}"),
        }
    }
    if let Err(e) = child.kill() {
        debug!("kill: {e}");
    }
    if let Err(e) = child.wait() {
        warn!("failed to reap engine process: {e}");
    }
}

/// Output filename bound on the last stage of a pipeline JSON document
pub fn writer_filename(pipeline_json: &str) -> Option<PathBuf> {
    let value: serde_json::Value = serde_json::from_str(pipeline_json).ok()?;
    let stages = value.get("pipeline")?.as_array()?;
    stages
        .last()?
        .get("filename")?
        .as_str()
        .map(PathBuf::from)
}
