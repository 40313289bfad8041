//! Named groups of forwards
//!
//! Stored as YAML in `config.yaml` under the application directory.

use anyhow::{Context, Result};
use portfwd_core::TunnelTarget;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// One forward inside a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardSpec {
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub local_port: u16,
    pub remote_port: u16,
}

impl ForwardSpec {
    /// Target for this forward, if exactly one of pod/service is set
    pub fn target(&self) -> Option<TunnelTarget> {
        match (&self.pod, &self.service) {
            (Some(pod), None) => Some(TunnelTarget::pod(
                &self.namespace,
                pod,
                self.local_port,
                self.remote_port,
            )),
            (None, Some(service)) => Some(TunnelTarget::service(
                &self.namespace,
                service,
                self.local_port,
                self.remote_port,
            )),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub forwards: Vec<ForwardSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

impl ProfileConfig {
    /// Load from `path`; a missing file is an empty config
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read profiles from {:?}", path))?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&text).with_context(|| format!("Failed to parse profiles in {:?}", path))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        let yaml = serde_yaml::to_string(self).context("Failed to serialize profiles")?;
        fs::write(path, yaml).with_context(|| format!("Failed to write profiles to {:?}", path))
    }

    pub fn get(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Replace the profile with the same name, or append it
    pub fn upsert(&mut self, profile: Profile) {
        match self.profiles.iter_mut().find(|p| p.name == profile.name) {
            Some(existing) => *existing = profile,
            None => self.profiles.push(profile),
        }
    }

    pub fn delete(&mut self, name: &str) -> Result<Profile> {
        let index = self
            .profiles
            .iter()
            .position(|p| p.name == name)
            .with_context(|| format!("Profile '{}' not found", name))?;
        Ok(self.profiles.remove(index))
    }

    pub fn names(&self) -> Vec<&str> {
        self.profiles.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for profile in &self.profiles {
            if profile.name.trim().is_empty() {
                anyhow::bail!("Profile name cannot be empty");
            }
            if !seen.insert(profile.name.as_str()) {
                anyhow::bail!("Duplicate profile name '{}'", profile.name);
            }
            for (i, forward) in profile.forwards.iter().enumerate() {
                validate_forward(forward)
                    .with_context(|| format!("Profile '{}' forward #{}", profile.name, i + 1))?;
            }
        }
        Ok(())
    }
}

fn validate_forward(forward: &ForwardSpec) -> Result<()> {
    if forward.namespace.trim().is_empty() {
        anyhow::bail!("namespace is required");
    }
    if forward.target().is_none() {
        anyhow::bail!("exactly one of pod or service must be set");
    }
    if forward.local_port == 0 || forward.remote_port == 0 {
        anyhow::bail!("ports must be between 1 and 65535");
    }
    Ok(())
}
