// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::path::Path;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub use vpmu::common::GuestKind;
pub use vpmu::VpmuMode;

/// Configuration for the standalone vPMU harness: the simulated host, the
/// vCPUs running on it, and the trapped accesses to replay against them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub main: Main,

    #[serde(default, rename = "vcpu")]
    pub vcpus: BTreeMap<String, Vcpu>,

    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

/// Host-wide vPMU settings.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Main {
    #[serde(default)]
    pub mode: VpmuMode,

    /// CPU family to model. When absent, the host's own family is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_family: Option<u8>,

    /// Size, in bytes, of the page each vCPU's register banks must fit in.
    #[serde(default = "default_shared_page_size")]
    pub shared_page_size: usize,
}

impl Default for Main {
    fn default() -> Self {
        Self {
            mode: VpmuMode::default(),
            cpu_family: None,
            shared_page_size: default_shared_page_size(),
        }
    }
}

fn default_shared_page_size() -> usize {
    vpmu::common::PAGE_SIZE
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Vcpu {
    pub id: u32,

    #[serde(default)]
    pub domain: u16,

    #[serde(default)]
    pub kind: GuestKind,
}

/// One event in a replay script. `vcpu` names an entry of [`Config::vcpus`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Step {
    Wrmsr { vcpu: String, msr: u32, value: u64 },
    Rdmsr { vcpu: String, msr: u32 },
    SwitchOut { vcpu: String },
    SaveForce { vcpu: String },
    SwitchIn { vcpu: String },
    Interrupt { vcpu: String },
    Dump { vcpu: String },
    Destroy { vcpu: String },
}

impl Step {
    /// The name of the vCPU this step acts on.
    pub fn vcpu(&self) -> &str {
        match self {
            Step::Wrmsr { vcpu, .. }
            | Step::Rdmsr { vcpu, .. }
            | Step::SwitchOut { vcpu }
            | Step::SaveForce { vcpu }
            | Step::SwitchIn { vcpu }
            | Step::Interrupt { vcpu }
            | Step::Dump { vcpu }
            | Step::Destroy { vcpu } => vcpu,
        }
    }
}

/// Errors which may be returned when parsing the harness configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key {0} not found in {1}")]
    KeyNotFound(String, String),
}

impl Config {
    /// Checks that every step refers to a configured vCPU.
    pub fn validate(&self) -> Result<(), ParseError> {
        for step in &self.steps {
            if !self.vcpus.contains_key(step.vcpu()) {
                return Err(ParseError::KeyNotFound(
                    step.vcpu().to_string(),
                    "vcpu".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    cfg.validate()?;
    Ok(cfg)
}
