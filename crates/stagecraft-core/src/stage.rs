//! Stage model: the ordered list of environments a release moves through.
//!
//! A `Pipeline` is built once from configuration and never mutated; its
//! stage order is the deployment order.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Characters reserved for store keys.
const KEY_SEPARATORS: [char; 2] = ['/', ':'];

/// Errors raised while validating a pipeline.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("pipeline has no stages")]
    Empty,

    #[error("duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("stage {stage}: {fleet} capacity min {min} exceeds max {max}")]
    InvalidBounds {
        stage: String,
        fleet: Fleet,
        min: u32,
        max: u32,
    },

    #[error("stage name must not be empty")]
    EmptyStageName,

    /// `/` and `:` separate the parts of store keys.
    #[error("name {0:?} must not contain '/' or ':'")]
    ReservedCharacter(String),
}

/// Target environment for a stage. Both fields are opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Environment {
    pub region: String,
    pub account: String,
}

/// Inclusive min/max count for one fleet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityBounds {
    pub min: u32,
    pub max: u32,
}

impl CapacityBounds {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// Clamp `count` into `[min, max]`.
    pub fn clamp(&self, count: u32) -> u32 {
        count.clamp(self.min, self.max)
    }

    pub fn contains(&self, count: u32) -> bool {
        (self.min..=self.max).contains(&count)
    }
}

/// The two independently scaled fleets of a stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Fleet {
    /// Underlying compute instances.
    Compute,
    /// Service tasks running on the compute fleet.
    Task,
}

impl Fleet {
    pub const ALL: [Fleet; 2] = [Fleet::Compute, Fleet::Task];

    pub fn as_str(&self) -> &'static str {
        match self {
            Fleet::Compute => "compute",
            Fleet::Task => "task",
        }
    }
}

impl fmt::Display for Fleet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the stage's health probe is served.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthEndpoint {
    /// `host:port` of the stage's load balancer.
    pub address: String,
    /// HTTP path, e.g. `/health`.
    #[serde(default = "default_health_path")]
    pub path: String,
}

fn default_health_path() -> String {
    "/health".to_string()
}

/// One deployment environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageDescriptor {
    pub name: String,
    pub environment: Environment,
    /// Production-sensitive stages wait for a manual approval.
    pub production: bool,
    pub compute_capacity: CapacityBounds,
    pub task_capacity: CapacityBounds,
    /// Handle to the stage's secret bundle. Passed through untouched.
    pub secret_ref: String,
    pub health_endpoint: HealthEndpoint,
}

impl StageDescriptor {
    /// Capacity bounds for the given fleet.
    pub fn bounds(&self, fleet: Fleet) -> CapacityBounds {
        match fleet {
            Fleet::Compute => self.compute_capacity,
            Fleet::Task => self.task_capacity,
        }
    }
}

/// Ordered, validated list of stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pipeline {
    name: String,
    stages: Vec<StageDescriptor>,
}

impl Pipeline {
    /// Validate and build a pipeline. Stage order is preserved.
    pub fn new(name: impl Into<String>, stages: Vec<StageDescriptor>) -> Result<Self, PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::Empty);
        }
        let name = name.into();
        if name.contains(KEY_SEPARATORS) {
            return Err(PipelineError::ReservedCharacter(name));
        }

        let mut seen = HashSet::new();
        for stage in &stages {
            if stage.name.trim().is_empty() {
                return Err(PipelineError::EmptyStageName);
            }
            if stage.name.contains(KEY_SEPARATORS) {
                return Err(PipelineError::ReservedCharacter(stage.name.clone()));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(PipelineError::DuplicateStage(stage.name.clone()));
            }
            for fleet in Fleet::ALL {
                let bounds = stage.bounds(fleet);
                if bounds.min > bounds.max {
                    return Err(PipelineError::InvalidBounds {
                        stage: stage.name.clone(),
                        fleet,
                        min: bounds.min,
                        max: bounds.max,
                    });
                }
            }
        }

        Ok(Self {
            name,
            stages,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageDescriptor> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Position of a stage in deployment order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
