//! Configuration for pkgbox: distro command templates, filesystem locations and
//! the container configuration text recorded in the state database.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Directories inside a container whose desktop files get host wrappers.
pub const CONTAINER_DESKTOP_DIRS: &[&str] =
    &["/usr/share/applications", "/usr/local/share/applications"];

/// Directories inside a container whose executables get host wrappers.
pub const CONTAINER_EXECUTABLE_DIRS: &[&str] = &["/usr/bin", "/usr/local/bin"];

/// Package manager command templates for a distribution.
///
/// The install template carries two placeholders: `{quiet}` is resolved once
/// from the quiet flag, `{opt_dep}` stays deferred until a concrete install
/// resolves it to the auto-install marker flag (or nothing).
#[derive(Debug, Clone, Deserialize)]
pub struct PkgMgr {
    pub install: String,
    pub quiet_flag: String,
    pub list_files: String,
    pub info: String,
    pub opt_deps: String,
    pub opt_dep_flag: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DistroConfig {
    pub pkgmgr: PkgMgr,
}

/// Load the command templates for a distribution. A missing file or missing
/// template key is fatal at startup, not recoverable per call.
pub fn load_distro_config(path: &str) -> Result<DistroConfig> {
    let expanded = shellexpand::tilde(path);
    let text = std::fs::read_to_string(expanded.as_ref())
        .with_context(|| format!("Failed to read distro configuration {expanded}"))?;
    toml::from_str(&text).with_context(|| format!("Invalid distro configuration {expanded}"))
}

/// Default distro configuration path for a distribution name.
pub fn default_distro_config(distribution: &str) -> Result<String> {
    let dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(dir
        .join("pkgbox")
        .join(format!("{distribution}.toml"))
        .to_string_lossy()
        .into_owned())
}

/// Path of the state database, creating its parent directory if needed.
pub fn state_db_path() -> Result<PathBuf> {
    let dir = dirs::data_local_dir()
        .context("Could not determine data directory")?
        .join("pkgbox");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
    Ok(dir.join("state.db"))
}

/// Host directory for generated desktop file wrappers.
pub fn user_applications_dir() -> Result<PathBuf> {
    Ok(dirs::data_dir()
        .context("Could not determine data directory")?
        .join("applications"))
}

/// Host directory for generated executable wrappers.
pub fn user_executables_dir() -> Result<PathBuf> {
    Ok(dirs::home_dir()
        .context("Could not determine home directory")?
        .join(".local")
        .join("bin"))
}

/// Container configuration, either still serialized or already parsed.
///
/// Callers hand over whichever form they have; it is normalized exactly once
/// (at the first section lookup) instead of being re-parsed ad hoc.
#[derive(Debug, Clone)]
pub enum BoxConfig {
    Raw(String),
    Parsed(IniDoc),
}

impl BoxConfig {
    /// Serialized INI text, as stored in the state database.
    pub fn to_ini_string(&self) -> String {
        match self {
            BoxConfig::Raw(text) => text.clone(),
            BoxConfig::Parsed(doc) => doc.to_ini_string(),
        }
    }

    /// Normalize to the parsed form for section lookups.
    pub fn parsed(&self) -> IniDoc {
        match self {
            BoxConfig::Raw(text) => IniDoc::parse(text),
            BoxConfig::Parsed(doc) => doc.clone(),
        }
    }
}

/// Minimal INI document: named sections of key/value pairs. Option keys are
/// case-insensitive (stored lowercased), matching how the container tooling
/// writes and reads these files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IniDoc {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl IniDoc {
    pub fn parse(text: &str) -> Self {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current: Option<String> = None;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim().to_string();
                sections.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }
            if let (Some(section), Some((key, value))) = (&current, line.split_once('=')) {
                sections
                    .entry(section.clone())
                    .or_default()
                    .insert(key.trim().to_lowercase(), value.trim().to_string());
            }
        }
        IniDoc { sections }
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)?
            .get(&key.to_lowercase())
            .map(String::as_str)
    }

    pub fn to_ini_string(&self) -> String {
        let mut out = String::new();
        for (name, entries) in &self.sections {
            out.push_str(&format!("[{name}]\n"));
            for (key, value) in entries {
                out.push_str(&format!("{key} = {value}\n"));
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ini_parse_sections_and_keys() {
        let doc = IniDoc::parse(
            "# container profile\n\
             [base]\n\
             Name = mybox\n\
             \n\
             [app_flags]\n\
             firefox = --new-instance\n\
             ; trailing comment\n",
        );
        assert_eq!(doc.get("base", "name"), Some("mybox"));
        assert_eq!(doc.get("base", "NAME"), Some("mybox"));
        assert_eq!(doc.get("app_flags", "firefox"), Some("--new-instance"));
        assert!(doc.get("missing", "firefox").is_none());
    }

    #[test]
    fn test_ini_round_trip_through_box_config() {
        let doc = IniDoc::parse("[app_flags]\nvlc = --no-qt-privacy-ask\n");
        let raw = BoxConfig::Parsed(doc.clone()).to_ini_string();
        assert_eq!(BoxConfig::Raw(raw).parsed(), doc);
    }

    #[test]
    fn test_distro_config_requires_all_template_keys() {
        let parsed: Result<DistroConfig, _> =
            toml::from_str("[pkgmgr]\ninstall = \"pacman -S {quiet} {opt_dep}\"\n");
        assert!(parsed.is_err());
    }
}
