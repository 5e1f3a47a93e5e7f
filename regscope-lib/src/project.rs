//! Project files: connection settings, register definitions, variables,
//! bits and view settings in one JSON document.

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

use crate::bits::{self, BitDefinition, BitError};
use crate::poll::PollConfig;
use crate::regs::{RegisterDefinition, RegisterError, RegisterMap};
use crate::session::{ConnectionSettings, Session};
use crate::variables::{VariableDefinition, VariableError, VariableSet};

pub const PROJECT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("cannot access {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed project: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error(transparent)]
    Variable(#[from] VariableError),
    #[error(transparent)]
    Bit(#[from] BitError),
    #[error("unsupported project version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid view settings: {0}")]
    BadViews(String),
}

fn default_version() -> u32 {
    PROJECT_VERSION
}

fn default_poll_interval() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    5000
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewSettings {
    /// Milliseconds between cycle starts.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Upper bound of the retry delay after failed cycles, milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff: u64,
    /// Milliseconds between reads of registers without `fast_poll`; zero
    /// reads them on every cycle.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub slow_interval: u64,
}

impl Default for ViewSettings {
    fn default() -> Self {
        ViewSettings {
            poll_interval: default_poll_interval(),
            max_backoff: default_max_backoff(),
            slow_interval: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub registers: Vec<RegisterDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<VariableDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bits: Vec<BitDefinition>,
    #[serde(default)]
    pub views: ViewSettings,
}

impl Default for Project {
    fn default() -> Self {
        Project {
            version: PROJECT_VERSION,
            connection: ConnectionSettings::default(),
            registers: Vec::new(),
            variables: Vec::new(),
            bits: Vec::new(),
            views: ViewSettings::default(),
        }
    }
}

impl Project {
    pub fn from_json(text: &str) -> Result<Self, ProjectError> {
        let project: Project = serde_json::from_str(text)?;
        if project.version > PROJECT_VERSION {
            return Err(ProjectError::UnsupportedVersion(project.version));
        }
        Ok(project)
    }

    pub fn to_json(&self) -> Result<String, ProjectError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ProjectError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ProjectError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ProjectError> {
        let path = path.as_ref();
        fs::write(path, self.to_json()? + "\n").map_err(|source| ProjectError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validated register map, in file order.
    pub fn register_map(&self) -> Result<RegisterMap, ProjectError> {
        Ok(RegisterMap::from_definitions(self.registers.clone())?)
    }

    /// Compiled variables, checked against `registers`.
    pub fn variable_set(&self, registers: &RegisterMap) -> Result<VariableSet, ProjectError> {
        let set = VariableSet::from_definitions(self.variables.clone())?;
        set.check(registers)?;
        Ok(set)
    }

    pub fn check_bits(&self) -> Result<(), ProjectError> {
        Ok(bits::validate_all(&self.bits)?)
    }

    /// Scheduler settings from the view settings. A zero poll interval is
    /// refused since the scheduler would never rest between cycles.
    pub fn poll_config(&self) -> Result<PollConfig, ProjectError> {
        if self.views.poll_interval == 0 {
            return Err(ProjectError::BadViews(
                "poll_interval must be at least 1 ms".to_string(),
            ));
        }
        let interval = Duration::from_millis(self.views.poll_interval);
        Ok(PollConfig {
            interval,
            backoff_base: interval,
            max_backoff: Duration::from_millis(self.views.max_backoff),
            slow_interval: Duration::from_millis(self.views.slow_interval),
            ..Default::default()
        })
    }

    /// Captures the current state of a session.
    pub fn from_session(session: &Session, config: &PollConfig) -> Self {
        Project {
            version: PROJECT_VERSION,
            connection: session.settings().clone(),
            registers: session.registers().definitions(),
            variables: Vec::new(),
            bits: Vec::new(),
            views: ViewSettings {
                poll_interval: config.interval.as_millis() as u64,
                max_backoff: config.max_backoff.as_millis() as u64,
                slow_interval: config.slow_interval.as_millis() as u64,
            },
        }
    }
}
