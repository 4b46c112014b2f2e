//! Experiment staging directory
//!
//! Operators announce an experiment over the protocol and then drop one
//! fragment per bioreactor into the staging directory. Fragments are named
//! `{experiment}.{mode}.{tick}` and hold a JSON document describing the
//! device, calibration and settings of one bioreactor.
//!
//! Fragments are written to a hidden temporary file and renamed into place,
//! so the admission loop never sees a half-written document. Files whose
//! name cannot be parsed are deleted on sight.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use sdk::device::{CalibrationBundle, PumpChannel};
use sdk::errors::EngineError;

use crate::reactor::BaseSettings;

/// One staged bioreactor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentFragment {
    /// Where the experiment's logs are written
    pub working_dir: PathBuf,
    /// Device address
    pub url: String,
    pub calibration: CalibrationBundle,
    pub base_settings: BaseSettings,
    /// Mode-specific settings, checked when the bioreactor is built
    #[serde(default)]
    pub special_settings: Value,
    /// Fluid drawn by each vial's pump channels
    #[serde(default)]
    pub fluid_key: BTreeMap<usize, BTreeMap<PumpChannel, String>>,
}

/// Parsed fragment file name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FragmentName {
    pub experiment: String,
    pub mode: String,
    pub tick: u64,
}

impl FragmentName {
    pub fn new(experiment: impl Into<String>, mode: impl Into<String>, tick: u64) -> Self {
        Self {
            experiment: experiment.into(),
            mode: mode.into(),
            tick,
        }
    }

    /// Parse `{experiment}.{mode}.{tick}`
    ///
    /// The experiment name may itself contain dots.
    pub fn parse(file_name: &str) -> Option<Self> {
        let mut parts = file_name.rsplitn(3, '.');
        let tick = parts.next()?.parse().ok()?;
        let mode = parts.next()?;
        let experiment = parts.next()?;
        if mode.is_empty() || experiment.is_empty() {
            return None;
        }
        Some(Self::new(experiment, mode, tick))
    }
}

impl fmt::Display for FragmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.experiment, self.mode, self.tick)
    }
}

/// Directory-backed queue of staged fragments
#[derive(Debug, Clone)]
pub struct StagingQueue {
    dir: PathBuf,
}

impl StagingQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, name: &FragmentName) -> PathBuf {
        self.dir.join(name.to_string())
    }

    /// Write a fragment atomically
    pub async fn stage(
        &self,
        name: &FragmentName,
        fragment: &ExperimentFragment,
    ) -> Result<PathBuf, EngineError> {
        let body = serde_json::to_vec_pretty(fragment)?;
        self.stage_raw(name, &body).await
    }

    /// Write an already serialized fragment atomically
    ///
    /// The body must parse as an `ExperimentFragment`.
    pub async fn stage_raw(&self, name: &FragmentName, body: &[u8]) -> Result<PathBuf, EngineError> {
        serde_json::from_slice::<ExperimentFragment>(body)
            .map_err(|e| EngineError::Staging(format!("{} is not a valid fragment: {}", name, e)))?;

        fs::create_dir_all(&self.dir).await?;
        let target = self.path_of(name);
        let temp = self.dir.join(format!(".{}.tmp", name));
        fs::write(&temp, body).await?;
        fs::rename(&temp, &target).await?;
        debug!(fragment = %name, "Fragment staged");
        Ok(target)
    }

    /// List staged fragments in name order
    ///
    /// Hidden files are in-flight writes and are skipped. Anything else that
    /// does not parse as a fragment name is deleted.
    pub async fn scan(&self) -> Result<Vec<FragmentName>, EngineError> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.starts_with('.') || !entry.file_type().await?.is_file() {
                continue;
            }
            match FragmentName::parse(file_name) {
                Some(name) => names.push(name),
                None => {
                    warn!(file = %file_name, "Removing unrecognised file from staging");
                    if let Err(e) = fs::remove_file(entry.path()).await {
                        warn!(file = %file_name, "Failed to remove: {}", e);
                    }
                }
            }
        }

        names.sort();
        Ok(names)
    }

    /// Read and parse a staged fragment
    pub async fn load(&self, name: &FragmentName) -> Result<ExperimentFragment, EngineError> {
        let body = fs::read(self.path_of(name)).await?;
        serde_json::from_slice(&body)
            .map_err(|e| EngineError::Staging(format!("{}: {}", name, e)))
    }

    /// Remove a fragment; already gone is fine
    pub async fn discard(&self, name: &FragmentName) -> Result<(), EngineError> {
        match fs::remove_file(self.path_of(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
