use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::NetError;

/// Metadata of one stored custom template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CustomTemplateInfo {
    pub name: String,
    pub description: String,
    pub path: PathBuf,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Flat directory of `{name}.{ext}` templates with optional `{name}.{desc}` siblings.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    dir: PathBuf,
    extension: String,
    description_extension: String,
}

impl TemplateStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        extension: impl Into<String>,
        description_extension: impl Into<String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
            description_extension: description_extension.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rejects names that are empty, too long or could escape the directory.
    pub fn validate_name(name: &str) -> Result<(), NetError> {
        let valid = !name.is_empty()
            && name.len() <= 128
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !name.contains("..");
        if valid {
            Ok(())
        } else {
            Err(NetError::InvalidTemplateName(name.to_string()))
        }
    }

    fn template_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{}", self.extension))
    }

    fn description_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{}", self.description_extension))
    }

    /// Writes the template and, when given, its description.
    pub fn save(&self, name: &str, content: &str, description: Option<&str>) -> Result<(), NetError> {
        Self::validate_name(name)?;
        fs::create_dir_all(&self.dir)?;
        fs::write(self.template_path(name), content)?;
        if let Some(description) = description.filter(|d| !d.trim().is_empty()) {
            fs::write(self.description_path(name), description.trim())?;
        }
        info!("Saved custom template {} in {}", name, self.dir.display());
        Ok(())
    }

    /// Template text, or `None` when absent.
    pub fn load(&self, name: &str) -> Result<Option<String>, NetError> {
        Self::validate_name(name)?;
        match fs::read_to_string(self.template_path(name)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        Self::validate_name(name).is_ok() && self.template_path(name).is_file()
    }

    /// Deletes the template and its description.
    pub fn delete(&self, name: &str) -> Result<(), NetError> {
        Self::validate_name(name)?;
        let path = self.template_path(name);
        if !path.is_file() {
            return Err(NetError::ParseTemplateNotFound(name.to_string()));
        }
        fs::remove_file(&path)?;
        let description = self.description_path(name);
        if description.is_file() {
            fs::remove_file(description)?;
        }
        info!("Deleted custom template {}", name);
        Ok(())
    }

    /// Stored templates, most recently modified first.
    pub fn list(&self) -> Result<Vec<CustomTemplateInfo>, NetError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut templates = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(self.extension.as_str()) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let description = fs::read_to_string(self.description_path(name))
                .map(|d| d.trim().to_string())
                .unwrap_or_default();
            let metadata = fs::metadata(&path)?;
            templates.push(CustomTemplateInfo {
                name: name.to_string(),
                description,
                created_at: metadata.created().ok().map(DateTime::<Utc>::from),
                modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
                path,
            });
        }
        templates.sort_by(|a, b| b.modified_at.cmp(&a.modified_at).then(a.name.cmp(&b.name)));
        debug!("Listed {} custom templates", templates.len());
        Ok(templates)
    }

    pub fn count(&self) -> usize {
        self.list().map(|t| t.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_list_and_delete_round_trip_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TemplateStore::new(dir.path().join("custom"), "textfsm", "desc");

        store
            .save("uplinks", "Value X (\\S+)\n", Some("  uplink ports  "))
            .expect("save");
        store.save("plain", "Value Y (\\S+)\n", None).expect("save");

        let listed = store.list().expect("list");
        assert_eq!(listed.len(), 2);
        let uplinks = listed
            .iter()
            .find(|t| t.name == "uplinks")
            .expect("uplinks listed");
        assert_eq!(uplinks.description, "uplink ports");
        assert!(store.contains("plain"));

        store.delete("uplinks").expect("delete");
        assert!(!dir.path().join("custom/uplinks.desc").exists());
        assert_eq!(store.load("uplinks").expect("load"), None);

        let err = match store.delete("uplinks") {
            Ok(_) => panic!("second delete should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, NetError::ParseTemplateNotFound(_)));
    }

    #[test]
    fn path_like_names_are_rejected() {
        for name in ["", "../etc/passwd", "a/b", ".hidden", "x..y"] {
            assert!(TemplateStore::validate_name(name).is_err(), "{name:?}");
        }
        assert!(TemplateStore::validate_name("cisco_ios_show-vlan.v2").is_ok());
    }

    #[test]
    fn listing_a_missing_directory_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TemplateStore::new(dir.path().join("absent"), "textfsm", "desc");
        assert!(store.list().expect("list").is_empty());
    }
}
