//! Manifest file store: the experiment spec is read from it and the status
//! is written back after every pass.

use std::fs;
use std::path::{Path, PathBuf};

use chaos_core::{ChaosError, Result};
use log::debug;

use crate::chaosimpl::ImplRegistry;
use crate::experiment::Experiment;

pub struct ExperimentStore {
    path: PathBuf,
}

impl ExperimentStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Experiment> {
        let content = fs::read_to_string(&self.path).map_err(|e| {
            ChaosError::InvalidConfig(format!(
                "Cannot read experiment {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let experiment = Experiment::from_yaml(&content)?;
        experiment.validate()?;
        Ok(experiment)
    }

    /// Pick up manifest edits while keeping the in-memory status.
    ///
    /// An edit whose fault does not build against `registry` is rejected and
    /// the current spec stays in place.
    pub fn refresh_spec(
        &self,
        experiment: &mut Experiment,
        registry: &ImplRegistry,
    ) -> Result<()> {
        let on_disk = self.load()?;
        if on_disk.name != experiment.name {
            return Err(ChaosError::InvalidConfig(format!(
                "Experiment renamed from {} to {}",
                experiment.name, on_disk.name
            )));
        }
        if on_disk.spec != experiment.spec {
            registry.build(&on_disk.spec.fault)?;
            debug!("Spec of {} changed on disk", experiment.name);
            experiment.spec = on_disk.spec;
        }
        Ok(())
    }

    /// Write the experiment, replacing the file atomically
    pub fn save(&self, experiment: &Experiment) -> Result<()> {
        let yaml = experiment.to_yaml()?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, yaml)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
