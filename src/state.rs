//! Persisted outcome of the last initializer run, kept next to the descriptor.

use serde_derive::{Deserialize, Serialize};

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::{Error, InitStage};
use crate::initializer::InitReport;
use crate::orchestrator::Provisioned;

/// Directory holding deployment state, relative to the project directory.
pub const STATE_DIR: &str = ".n8n-deploy";

/// State file name inside [`STATE_DIR`].
pub const STATE_FILE: &str = "state.json";

/// Result of an initializer run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum InitOutcome {
    /// All four stages completed.
    Ready,
    /// A stage failed; later stages did not run.
    Failed {
        /// The failing stage.
        stage: InitStage,
        /// The error message.
        message: String,
    },
}

/// One record in the state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitRecord {
    /// Service the initializer ran for.
    pub service: String,
    /// Container the initializer ran in, `None` for local runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Seconds since the unix epoch when the run finished.
    pub finished_at: u64,
    /// How the run ended.
    pub outcome: InitOutcome,
}

impl InitRecord {
    /// A record stamped with the current time.
    pub fn now(service: &str, container_id: Option<&str>, outcome: InitOutcome) -> InitRecord {
        let finished_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        InitRecord {
            service: service.to_owned(),
            container_id: container_id.map(str::to_owned),
            finished_at,
            outcome,
        }
    }
}

/// Reads and writes `.n8n-deploy/state.json`.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// The store for a project directory.
    pub fn new<P: AsRef<Path>>(project_dir: P) -> StateStore {
        StateStore {
            path: project_dir.as_ref().join(STATE_DIR).join(STATE_FILE),
        }
    }

    /// Path of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The last record for `service`, if any.
    pub fn load(&self, service: &str) -> Result<Option<InitRecord>, Error> {
        Ok(self
            .load_all()?
            .into_iter()
            .find(|record| record.service == service))
    }

    fn load_all(&self) -> Result<Vec<InitRecord>, Error> {
        match fs::read(&self.path) {
            Ok(contents) => Ok(serde_json::from_slice(&contents)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Record the result of an initializer run for `provisioned`. Errors without a stage are
    /// not recorded: they say nothing about the deployment.
    pub fn record(
        &self,
        provisioned: &Provisioned,
        result: &Result<InitReport, Error>,
    ) -> Result<(), Error> {
        let outcome = match result {
            Ok(_) => InitOutcome::Ready,
            Err(e) => match e.stage() {
                Some(stage) => InitOutcome::Failed {
                    stage,
                    message: e.to_string(),
                },
                None => return Ok(()),
            },
        };
        self.save(&InitRecord::now(
            provisioned.service(),
            provisioned.container_id(),
            outcome,
        ))
    }

    /// Replace the record for the record's service.
    pub fn save(&self, record: &InitRecord) -> Result<(), Error> {
        let mut records = self.load_all()?;
        records.retain(|r| r.service != record.service);
        records.push(record.clone());

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        // readers only ever see a complete file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&records)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!("recorded initializer outcome in {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert_eq!(store.load("n8n").unwrap(), None);
    }

    #[test]
    fn saves_one_record_per_service() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        let failed = InitRecord::now(
            "n8n",
            Some("abc"),
            InitOutcome::Failed {
                stage: InitStage::LanguageDependencies,
                message: String::from("manifest missing"),
            },
        );
        store.save(&failed).unwrap();
        assert_eq!(store.load("n8n").unwrap(), Some(failed));

        let ready = InitRecord::now("n8n", Some("abc"), InitOutcome::Ready);
        store.save(&ready).unwrap();
        assert_eq!(store.load("n8n").unwrap(), Some(ready));

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"result\": \"ready\""));
        assert_eq!(raw.matches("\"service\"").count(), 1);
    }
}
