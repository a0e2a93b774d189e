use crate::config::IngestConfig;
use crate::services::interpreter::ResultInterpreter;
use crate::services::staging::StagedFile;
use async_trait::async_trait;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, error, warn};

/// Terminal result of one classification attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassificationOutcome {
    /// Target class found; carries the label to store
    Detected(String),
    /// Classifier ran but did not report the target class
    NotDetected,
    /// No usable result could be obtained
    Failed(ClassifierError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifierError {
    #[error("Failed to spawn classifier: {0}")]
    Spawn(String),

    #[error("Classifier exited with status {code:?} and no usable output")]
    Exit { code: Option<i32> },

    #[error("Classifier timed out after {0:?}")]
    Timeout(Duration),

    #[error("Classifier I/O error: {0}")]
    Io(String),
}

/// Which stdout token is authoritative when the classifier prints several
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LabelPolicy {
    First,
    #[default]
    Last,
}

impl FromStr for LabelPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            other => Err(format!("unknown label policy '{}'", other)),
        }
    }
}

/// Trait for image classifier implementations
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify a staged image. Must not return before any process it
    /// started has exited.
    async fn classify(&self, staged: &StagedFile) -> ClassificationOutcome;

    /// Check if the classifier can be launched at all
    async fn health_check(&self) -> bool;
}

/// Runs an external executable as `program [args..] <staged path>` and reads
/// its verdict from stdout.
///
/// Stdout lines are tokens; lines starting with `error:` are the
/// classifier's own failure reports and never count as a label. Stderr is
/// only logged.
pub struct SubprocessClassifier {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    policy: LabelPolicy,
    interpreter: ResultInterpreter,
}

struct RawRun {
    /// Token picked under the label policy
    token: Option<String>,
    status: ExitStatus,
}

impl SubprocessClassifier {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        interpreter: ResultInterpreter,
        timeout: Duration,
        policy: LabelPolicy,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            policy,
            interpreter,
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(
            config.classifier_program.clone(),
            config.classifier_args.clone(),
            ResultInterpreter::new(config.target_label.clone()),
            config.classifier_timeout,
            config.label_policy,
        )
    }

    async fn collect(&self, child: &mut Child) -> std::io::Result<RawRun> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("classifier stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("classifier stderr not captured"))?;

        // Output is free text, so lines are read as bytes and decoded lossily.
        // Buffers live across iterations because read_until keeps partial
        // reads in them when the other select branch wins.
        let mut out_reader = BufReader::new(stdout);
        let mut err_reader = Some(BufReader::new(stderr));
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let mut out_open = true;
        let mut token = None;

        while out_open || err_reader.is_some() {
            tokio::select! {
                read = out_reader.read_until(b'\n', &mut out_buf), if out_open => {
                    if read? == 0 {
                        out_open = false;
                    } else {
                        self.record_token(&String::from_utf8_lossy(&out_buf), &mut token);
                        out_buf.clear();
                    }
                }
                read = read_stderr_line(&mut err_reader, &mut err_buf), if err_reader.is_some() => {
                    match read {
                        Ok(0) => err_reader = None,
                        Ok(_) => {
                            let line = String::from_utf8_lossy(&err_buf);
                            if !line.trim().is_empty() {
                                warn!("classifier stderr: {}", line.trim_end());
                            }
                            err_buf.clear();
                        }
                        Err(e) => {
                            warn!("Stopped reading classifier stderr: {}", e);
                            err_reader = None;
                        }
                    }
                }
            }
        }

        // Both pipes are closed; wait for the process itself before anyone
        // touches the staged file.
        let status = child.wait().await?;
        Ok(RawRun { token, status })
    }

    fn record_token(&self, line: &str, current: &mut Option<String>) {
        let token = line.trim();
        if token.is_empty() {
            return;
        }
        if let Some(reason) = token.strip_prefix("error:") {
            warn!("classifier reported an error: {}", reason.trim());
            return;
        }
        debug!("classifier token: {}", token);
        if self.policy == LabelPolicy::Last || current.is_none() {
            *current = Some(token.to_string());
        }
    }

    fn finish(&self, run: RawRun) -> ClassificationOutcome {
        match run.token.as_deref() {
            Some(token) => {
                if !run.status.success() {
                    warn!(
                        "Classifier exited with {} but produced output, using '{}'",
                        run.status, token
                    );
                }
                self.interpreter.interpret(token)
            }
            None if run.status.success() => ClassificationOutcome::NotDetected,
            None => ClassificationOutcome::Failed(ClassifierError::Exit {
                code: run.status.code(),
            }),
        }
    }
}

#[async_trait]
impl Classifier for SubprocessClassifier {
    async fn classify(&self, staged: &StagedFile) -> ClassificationOutcome {
        let spawned = Command::new(&self.program)
            .args(&self.args)
            .arg(staged.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn classifier '{}': {}", self.program, e);
                return ClassificationOutcome::Failed(ClassifierError::Spawn(e.to_string()));
            }
        };

        let collected = tokio::time::timeout(self.timeout, self.collect(&mut child)).await;
        match collected {
            Ok(Ok(run)) => self.finish(run),
            Ok(Err(e)) => {
                error!("Lost contact with classifier: {}", e);
                let _ = child.kill().await;
                ClassificationOutcome::Failed(ClassifierError::Io(e.to_string()))
            }
            Err(_) => {
                warn!(
                    "Classifier exceeded {:?} on {:?}, killing it",
                    self.timeout,
                    staged.path()
                );
                // kill() also reaps the process
                if let Err(e) = child.kill().await {
                    error!("Failed to kill classifier: {}", e);
                }
                ClassificationOutcome::Failed(ClassifierError::Timeout(self.timeout))
            }
        }
    }

    async fn health_check(&self) -> bool {
        program_available(&self.program)
    }
}

async fn read_stderr_line(
    reader: &mut Option<BufReader<ChildStderr>>,
    buf: &mut Vec<u8>,
) -> std::io::Result<usize> {
    match reader {
        Some(reader) => reader.read_until(b'\n', buf).await,
        None => Ok(0),
    }
}

fn program_available(program: &str) -> bool {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return path.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}
