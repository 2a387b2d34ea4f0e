use crate::{errors::ContributeError, interfaces::ArtifactComputer, utils::create_parent_directory};

use async_trait::async_trait;
use fs_err::File;
use secrecy::{ExposeSecret, SecretString};
use std::{
    io::Write,
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tracing::{debug, error, info};

/// Environment variable carrying the contributor's randomness to the computing program.
pub const CONTRIBUTION_ENTROPY: &str = "CONTRIBUTION_ENTROPY";

/// Environment variable set to `1` when the computing program must apply a beacon.
pub const CONTRIBUTION_BEACON: &str = "CONTRIBUTION_BEACON";

///
/// Collects the human-readable transcript of a computation.
///
/// Every line is appended to the transcript file and kept in memory, so the
/// contribution hash can be read back once the computation finishes.
///
pub struct TranscriptLogger {
    path: PathBuf,
    file: File,
    contents: String,
}

impl TranscriptLogger {
    /// Creates the transcript file at `path`, truncating a previous one.
    pub fn create(path: &Path) -> Result<Self, ContributeError> {
        create_parent_directory(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: File::create(path)?,
            contents: String::new(),
        })
    }

    pub fn log(&mut self, line: &str) -> Result<(), ContributeError> {
        writeln!(self.file, "{}", line).map_err(|e| {
            ContributeError::FailedComputation(format!("could not write to {}: {}", self.path.display(), e))
        })?;
        self.contents.push_str(line);
        self.contents.push('\n');
        Ok(())
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

///
/// Runs an external program to compute the contribution.
///
/// The program is invoked as `<program> [args..] <predecessor> <target> <contributor>`
/// with the randomness in [`CONTRIBUTION_ENTROPY`], so it never appears in the
/// process list. Each line the program prints is added to the transcript.
///
#[derive(Debug, Clone)]
pub struct ProcessComputer {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessComputer {
    pub fn new(program: PathBuf) -> Self {
        Self { program, args: vec![] }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[async_trait]
impl ArtifactComputer for ProcessComputer {
    async fn compute(
        &self,
        predecessor: &Path,
        target: &Path,
        contributor: &str,
        randomness: &SecretString,
        transcript: &mut TranscriptLogger,
        is_finalizing: bool,
    ) -> Result<(), ContributeError> {
        info!("Running {} on {}", self.program.display(), predecessor.display());

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(predecessor)
            .arg(target)
            .arg(contributor)
            .env(CONTRIBUTION_ENTROPY, randomness.expose_secret())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if is_finalizing {
            command.env(CONTRIBUTION_BEACON, "1");
        }

        let mut child = command.spawn().map_err(|e| {
            ContributeError::FailedComputation(format!("could not start {}: {}", self.program.display(), e))
        })?;

        let failed = |e: std::io::Error| ContributeError::FailedComputation(format!("{}: {}", self.program.display(), e));

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await.map_err(failed)? {
                debug!("{}", line);
                transcript.log(&line)?;
            }
        }

        let status = child.wait().await.map_err(failed)?;
        if !status.success() {
            error!("{} exited with {}", self.program.display(), status);
            return Err(ContributeError::FailedComputation(format!(
                "{} exited with {}",
                self.program.display(),
                status
            )));
        }

        Ok(())
    }
}
