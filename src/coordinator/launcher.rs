//! Job launchers: how a submitted stage actually starts.
//!
//! - [`LocalLauncher`] runs the stage as a task in this process.
//! - [`ProcessLauncher`] runs it as a child process of this binary.
//!
//! Both accept the same argument maps, parsed by the same command line
//! surface, so a chain behaves the same under either launcher.

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Weak};
use tokio::process::{Child, Command};
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use uuid::Uuid;

use super::RunState;
use crate::config::args::to_argv;
use crate::config::{Settings, StageCommand};
use crate::error::{
    LaunchError, LauncherClosedSnafu, PollSnafu, SpawnSnafu, UnknownJobSnafu, UnknownRunSnafu,
};
use crate::stage::{self, StageBinding, StageContext, StageTable};

/// Starts stage runs and reports their state.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    /// Start a run of `job_name` and return its run id.
    async fn start_job_run(
        &self,
        job_name: &str,
        arguments: &HashMap<String, String>,
    ) -> Result<String, LaunchError>;

    /// Current state of a run.
    async fn get_job_run(&self, job_name: &str, run_id: &str) -> Result<RunState, LaunchError>;

    /// Wait for runs this launcher still owns. Launchers whose runs outlive
    /// the process return at once.
    async fn wait_idle(&self) {}
}

fn command_for(
    stages: &StageTable,
    job_name: &str,
    arguments: &HashMap<String, String>,
) -> Result<(StageBinding, StageCommand), LaunchError> {
    let binding = stages
        .binding_for_job(job_name)
        .context(UnknownJobSnafu { job_name })?;
    let command = StageCommand::from_arguments(binding.subcommand(), arguments).map_err(|e| {
        LaunchError::InvalidArguments {
            job_name: job_name.to_string(),
            message: e.to_string(),
        }
    })?;
    Ok((binding.clone(), command))
}

#[derive(Debug, Clone)]
struct LocalRun {
    job_name: String,
    state: RunState,
}

/// Runs chained stages as tasks of the current runtime.
pub struct LocalLauncher {
    this: Weak<LocalLauncher>,
    settings: Arc<Settings>,
    http: Client,
    stages: Arc<StageTable>,
    tracker: TaskTracker,
    runs: DashMap<String, LocalRun>,
}

impl LocalLauncher {
    pub fn new(settings: Arc<Settings>, http: Client, stages: Arc<StageTable>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            settings,
            http,
            stages,
            tracker: TaskTracker::new(),
            runs: DashMap::new(),
        })
    }

    /// Every run started so far, by run id.
    pub fn runs(&self) -> HashMap<String, (String, RunState)> {
        self.runs
            .iter()
            .map(|entry| {
                let run = entry.value();
                (entry.key().clone(), (run.job_name.clone(), run.state))
            })
            .collect()
    }

    fn finish(&self, run_id: &str, state: RunState) {
        if let Some(mut run) = self.runs.get_mut(run_id) {
            run.state = state;
        }
    }
}

#[async_trait]
impl JobLauncher for LocalLauncher {
    async fn start_job_run(
        &self,
        job_name: &str,
        arguments: &HashMap<String, String>,
    ) -> Result<String, LaunchError> {
        let (_, command) = command_for(&self.stages, job_name, arguments)?;
        let launcher = self
            .this
            .upgrade()
            .context(LauncherClosedSnafu { job_name })?;

        let run_id = format!("jr_{}", Uuid::now_v7().simple());
        self.runs.insert(
            run_id.clone(),
            LocalRun {
                job_name: job_name.to_string(),
                state: RunState::Running,
            },
        );

        let ctx = StageContext {
            settings: self.settings.clone(),
            http: self.http.clone(),
            stages: self.stages.clone(),
            launcher: launcher.clone(),
        };
        let task_run_id = run_id.clone();
        self.tracker.spawn(async move {
            let result = Box::pin(stage::run(&ctx, command)).await;
            let state = match result {
                Ok(_) => RunState::Succeeded,
                Err(_) => RunState::Failed,
            };
            launcher.finish(&task_run_id, state);
        });
        debug!("Started local run {} of {}", run_id, job_name);

        Ok(run_id)
    }

    async fn get_job_run(&self, job_name: &str, run_id: &str) -> Result<RunState, LaunchError> {
        match self.runs.get(run_id) {
            Some(run) if run.job_name == job_name => Ok(run.state),
            _ => UnknownRunSnafu { job_name, run_id }.fail(),
        }
    }

    async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

/// Runs chained stages as child processes of the current executable.
///
/// Children inherit stdout and stderr and keep running when this process
/// exits.
pub struct ProcessLauncher {
    program: Option<PathBuf>,
    config: Option<PathBuf>,
    stages: Arc<StageTable>,
    children: DashMap<String, (String, Child)>,
}

impl ProcessLauncher {
    /// `config` is forwarded to children as `--config`.
    pub fn new(config: Option<PathBuf>, stages: Arc<StageTable>) -> Self {
        Self {
            program: None,
            config,
            stages,
            children: DashMap::new(),
        }
    }

    /// Run `program` instead of the current executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    fn argv(&self, binding: &StageBinding, arguments: &HashMap<String, String>) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(config) = &self.config {
            argv.push("--config".to_string());
            argv.push(config.display().to_string());
        }
        argv.push(binding.subcommand().to_string());
        argv.extend(to_argv(arguments));
        argv
    }
}

#[async_trait]
impl JobLauncher for ProcessLauncher {
    async fn start_job_run(
        &self,
        job_name: &str,
        arguments: &HashMap<String, String>,
    ) -> Result<String, LaunchError> {
        // Parse here so bad arguments fail the submission, not the child.
        let (binding, _) = command_for(&self.stages, job_name, arguments)?;

        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe().context(SpawnSnafu { job_name })?,
        };
        let argv = self.argv(&binding, arguments);
        let child = Command::new(&program)
            .args(&argv)
            .stdin(Stdio::null())
            .spawn()
            .context(SpawnSnafu { job_name })?;

        let run_id = format!("jr_{}", Uuid::now_v7().simple());
        info!(
            "Spawned {} {} as run {} (pid {:?})",
            program.display(),
            argv.join(" "),
            run_id,
            child.id()
        );
        self.children
            .insert(run_id.clone(), (job_name.to_string(), child));
        Ok(run_id)
    }

    async fn get_job_run(&self, job_name: &str, run_id: &str) -> Result<RunState, LaunchError> {
        let Some(mut entry) = self.children.get_mut(run_id) else {
            return UnknownRunSnafu { job_name, run_id }.fail();
        };
        let (owner, child) = entry.value_mut();
        ensure!(owner.as_str() == job_name, UnknownRunSnafu { job_name, run_id });

        let status = child.try_wait().context(PollSnafu { job_name, run_id })?;
        Ok(match status {
            None => RunState::Running,
            Some(status) if status.success() => RunState::Succeeded,
            Some(_) => RunState::Failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn process_arguments() -> HashMap<String, String> {
        [
            ("s3_bucket_raw", "banks-raw"),
            ("s3_bucket_processed", "banks-processed"),
            ("s3_data_object_key", "raw_files/banks_data_01-01-2024T10:00:00.json"),
            ("glue_database", "banks"),
            ("glue_table", "accounts"),
            ("next_glue_job", "dispatch"),
            ("DRYRUN", "true"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn local() -> Arc<LocalLauncher> {
        LocalLauncher::new(
            Arc::new(Settings::default()),
            Client::new(),
            Arc::new(StageTable::default()),
        )
    }

    #[tokio::test]
    async fn test_local_rejects_unknown_job_and_bad_arguments() {
        let launcher = local();
        let err = launcher
            .start_job_run("publish", &process_arguments())
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::UnknownJob { .. }));

        let mut arguments = process_arguments();
        arguments.remove("glue_table");
        let err = launcher.start_job_run("process", &arguments).await.unwrap_err();
        assert!(matches!(err, LaunchError::InvalidArguments { .. }));
        assert!(launcher.runs().is_empty());
    }

    #[tokio::test]
    async fn test_local_run_is_tracked_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = local();
        let mut arguments = process_arguments();
        // Nothing at the raw location, so the run fails after starting.
        arguments.insert(
            "s3_bucket_raw".to_string(),
            dir.path().join("raw").display().to_string(),
        );

        let run_id = launcher.start_job_run("process", &arguments).await.unwrap();
        assert!(matches!(
            launcher.get_job_run("process", &run_id).await.unwrap(),
            RunState::Running | RunState::Failed
        ));
        assert!(launcher.get_job_run("dispatch", &run_id).await.is_err());

        launcher.wait_idle().await;
        assert_eq!(
            launcher.get_job_run("process", &run_id).await.unwrap(),
            RunState::Failed
        );
    }

    #[test]
    fn test_process_argv() {
        let launcher = ProcessLauncher::new(
            Some(PathBuf::from("/etc/avalanche.yaml")),
            Arc::new(StageTable::default()),
        );
        let table = StageTable::default();
        let binding = table.binding_for_job("process-spark").unwrap();
        let argv = launcher.argv(
            binding,
            &HashMap::from([("glue_table".to_string(), "accounts".to_string())]),
        );
        assert_eq!(
            argv,
            vec![
                "--config",
                "/etc/avalanche.yaml",
                "process-spark",
                "--glue_table",
                "accounts"
            ]
        );
    }

    #[tokio::test]
    async fn test_process_child_state() {
        let launcher = ProcessLauncher::new(None, Arc::new(StageTable::default()))
            .with_program("true");
        let run_id = launcher
            .start_job_run("process", &process_arguments())
            .await
            .unwrap();

        let mut state = RunState::Running;
        for _ in 0..100 {
            state = launcher.get_job_run("process", &run_id).await.unwrap();
            if state != RunState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state, RunState::Succeeded);
    }
}
