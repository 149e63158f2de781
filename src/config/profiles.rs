//! Session profiles selected by the client's init frame.
//!
//! A profile bundles the system instructions, the greeting instructions and
//! the tool definitions for one kind of conversation. Their contents are
//! opaque to the relay and forwarded to the service as-is.
//!
//! ```yaml
//! profiles:
//!   - id: support-agent
//!     instructions: "You are a helpful support agent."
//!     greeting: "Greet the user briefly."
//!     tools:
//!       - name: lookup_order
//!         parameters: { type: object, properties: { order_id: { type: string } } }
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::upstream::ToolDef;
use crate::errors::ConfigError;

/// One system-configuration profile.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Profile {
    pub id: String,
    /// System instructions for the session
    pub instructions: String,
    /// Instructions for the one-shot greeting response
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolDef>,
}

#[derive(Debug, Deserialize)]
struct ProfilesFile {
    #[serde(default)]
    profiles: Vec<Profile>,
}

/// Immutable lookup table of profiles, shared by all sessions.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, Arc<Profile>>,
}

impl ProfileRegistry {
    pub fn from_profiles(profiles: Vec<Profile>) -> Result<Self, ConfigError> {
        let mut map = HashMap::with_capacity(profiles.len());
        for profile in profiles {
            if profile.id.trim().is_empty() {
                return Err(ConfigError::Invalid("profile with empty id".to_string()));
            }
            let id = profile.id.clone();
            if map.insert(id.clone(), Arc::new(profile)).is_some() {
                return Err(ConfigError::Invalid(format!("duplicate profile id '{id}'")));
            }
        }
        Ok(Self { profiles: map })
    }

    pub fn from_yaml(contents: &str, origin: &str) -> Result<Self, ConfigError> {
        let file: ProfilesFile =
            serde_yaml::from_str(contents).map_err(|source| ConfigError::Yaml {
                path: origin.to_string(),
                source,
            })?;
        Self::from_profiles(file.profiles)
    }

    /// Load profiles from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let registry = Self::from_yaml(&contents, &path.display().to_string())?;
        info!(
            path = %path.display(),
            count = registry.len(),
            "Loaded session profiles"
        );
        Ok(registry)
    }

    /// Like [`load`](Self::load), but a missing file yields an empty registry.
    pub fn load_or_empty(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!(
                path = %path.display(),
                "Profiles file not found, every init will be rejected"
            );
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Profile>> {
        self.profiles.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.profiles.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Profile ids in sorted order.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
profiles:
  - id: coach
    instructions: "You are a coach."
    greeting: "Say hi."
    tools:
      - type: function
        name: get_phrases
        description: "Return phrases"
        parameters:
          type: object
  - id: plain
    instructions: "Be brief."
"#;

    #[test]
    fn test_parse_profiles() {
        let registry = ProfileRegistry::from_yaml(SAMPLE, "inline").unwrap();
        assert_eq!(registry.ids(), vec!["coach", "plain"]);

        let coach = registry.get("coach").unwrap();
        assert_eq!(coach.greeting.as_deref(), Some("Say hi."));
        assert_eq!(coach.tools.len(), 1);
        assert_eq!(coach.tools[0].name, "get_phrases");

        let plain = registry.get("plain").unwrap();
        assert!(plain.greeting.is_none());
        assert!(plain.tools.is_empty());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_tool_type_defaults_to_function() {
        let yaml = r#"
profiles:
  - id: a
    instructions: "x"
    tools:
      - name: t
"#;
        let registry = ProfileRegistry::from_yaml(yaml, "inline").unwrap();
        assert_eq!(registry.get("a").unwrap().tools[0].tool_type, "function");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let yaml = r#"
profiles:
  - id: a
    instructions: "x"
  - id: a
    instructions: "y"
"#;
        assert!(matches!(
            ProfileRegistry::from_yaml(yaml, "inline"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_load_or_empty_missing_file() {
        let registry = ProfileRegistry::load_or_empty(Path::new("/nonexistent/p.yaml")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("profiles.yaml");
        fs::write(&path, SAMPLE).unwrap();

        let registry = ProfileRegistry::load(&path).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("coach"));
    }
}
