// src/handlers/command.rs
//
// Collaborators backed by external programs, for hosts that ship the backup
// and discovery logic as separate executables.

use std::process::Output;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::handlers::{ProjectBackup, ProjectInitializer};
use crate::job::{BackupOptions, BackupSummary, DateRange};

/// A program plus leading arguments, e.g. `["/usr/bin/backup", "--verbose"]`.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Split on whitespace; no shell quoting.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(String::from);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);
        cmd
    }
}

fn check_status(what: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    bail!("{what} exited with {}: {}", output.status, stderr.trim())
}

/// Runs `<program> <args..> <projectId>` and reads `{"errors":N,"completed":M}`
/// from stdout.
#[derive(Debug, Clone)]
pub struct CommandBackup {
    pub spec: CommandSpec,
    /// Parallel units the backup program may run, passed as `BACKUP_CONCURRENCY`.
    pub concurrency: usize,
    /// Replica read preference, passed as `BACKUP_READ_PREFERENCE`.
    pub read_preference: String,
}

#[async_trait]
impl ProjectBackup for CommandBackup {
    async fn backup_project(
        &self,
        project_id: &str,
        _options: &BackupOptions,
    ) -> Result<BackupSummary> {
        debug!(target: "dispatcher", program = %self.spec.program, %project_id, "spawning backup command");
        let output = self
            .spec
            .command()
            .arg(project_id)
            .env("BACKUP_CONCURRENCY", self.concurrency.to_string())
            .env("BACKUP_READ_PREFERENCE", &self.read_preference)
            .output()
            .await
            .with_context(|| format!("spawning {}", self.spec.program))?;

        check_status("backup command", &output)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let summary: BackupSummary = serde_json::from_str(stdout.trim())
            .with_context(|| format!("parsing backup summary {:?}", stdout.trim()))?;
        Ok(summary)
    }
}

/// Runs `<program> <args..> <startDate> <endDate>`.
#[derive(Debug, Clone)]
pub struct CommandInitializer {
    pub spec: CommandSpec,
}

#[async_trait]
impl ProjectInitializer for CommandInitializer {
    async fn initialize_projects(&self, range: &DateRange) -> Result<()> {
        debug!(target: "dispatcher", program = %self.spec.program, %range, "spawning initialization command");
        let output = self
            .spec
            .command()
            .arg(&range.start_date)
            .arg(&range.end_date)
            .output()
            .await
            .with_context(|| format!("spawning {}", self.spec.program))?;

        check_status("initialization command", &output)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: "sh".into(),
            args: vec!["-c".into(), script.into(), "sh".into()],
        }
    }

    #[test]
    fn parse_splits_program_and_args() {
        let spec = CommandSpec::parse("  /opt/backup --fast  run ").unwrap();
        assert_eq!(spec.program, "/opt/backup");
        assert_eq!(spec.args, vec!["--fast", "run"]);
        assert!(CommandSpec::parse("   ").is_none());
    }

    #[tokio::test]
    async fn backup_reads_summary_from_stdout() {
        let backup = CommandBackup {
            spec: sh(r#"echo "{\"errors\":1,\"completed\":$BACKUP_CONCURRENCY}""#),
            concurrency: 50,
            read_preference: "secondaryPreferred".into(),
        };
        let summary = backup
            .backup_project("P1", &BackupOptions::default())
            .await
            .unwrap();
        assert_eq!(summary, BackupSummary { errors: 1, completed: 50 });
    }

    #[tokio::test]
    async fn project_id_is_last_argument() {
        let backup = CommandBackup {
            spec: sh(r#"test "$1" = "P7" && echo '{"errors":0,"completed":1}'"#),
            concurrency: 1,
            read_preference: "primary".into(),
        };
        assert!(backup.backup_project("P7", &BackupOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let init = CommandInitializer {
            spec: sh("echo 'no such range' >&2; exit 3"),
        };
        let range = DateRange {
            start_date: "2024-01-01".into(),
            end_date: "2024-01-31".into(),
        };
        let err = init.initialize_projects(&range).await.unwrap_err();
        assert!(err.to_string().contains("no such range"), "{err}");
    }
}
