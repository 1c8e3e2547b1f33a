//! Rendered Ignition documents.

use crate::error::{ConfError, Result};
use crate::units::{autologin_units, mount_unit};
use serde_json::{json, Value};
use std::fmt;

/// Ignition spec family a config is rendered against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IgnitionVersion {
    /// Spec 2.x (rendered as 2.2.0)
    V2,
    /// Spec 3.x (rendered as 3.0.0)
    #[default]
    V3,
}

impl IgnitionVersion {
    /// Version string written into the empty template.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V2 => "2.2.0",
            Self::V3 => "3.0.0",
        }
    }

    fn major(&self) -> &'static str {
        match self {
            Self::V2 => "2",
            Self::V3 => "3",
        }
    }

    fn from_version_str(s: &str) -> Option<Self> {
        match s.split('.').next() {
            Some("2") => Some(Self::V2),
            Some("3") => Some(Self::V3),
            _ => None,
        }
    }
}

impl fmt::Display for IgnitionVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Input to [`render`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// The empty template
    Empty,
    /// Raw Ignition JSON, typically read from a file
    Ignition(String),
}

/// A rendered first-boot configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Conf {
    version: IgnitionVersion,
    doc: Value,
}

/// Render `source` against the requested schema version.
///
/// # Errors
/// Returns an error if the source is not JSON, lacks `ignition.version`,
/// declares an unknown version, or belongs to a different spec family.
pub fn render(source: &Source, version: IgnitionVersion) -> Result<Conf> {
    let doc = match source {
        Source::Empty => json!({ "ignition": { "version": version.as_str() } }),
        Source::Ignition(raw) => {
            let doc: Value = serde_json::from_str(raw)?;
            check_version(&doc, version)?;
            doc
        }
    };
    tracing::debug!(%version, "Rendered Ignition config");
    Ok(Conf { version, doc })
}

fn check_version(doc: &Value, expected: IgnitionVersion) -> Result<()> {
    if !doc.is_object() {
        return Err(ConfError::Malformed("top level must be an object".into()));
    }
    let found = doc
        .pointer("/ignition/version")
        .and_then(Value::as_str)
        .ok_or_else(|| ConfError::Malformed("missing ignition.version".into()))?;

    match IgnitionVersion::from_version_str(found) {
        None => Err(ConfError::UnsupportedVersion {
            found: found.to_string(),
        }),
        Some(v) if v != expected => Err(ConfError::VersionMismatch {
            found: found.to_string(),
            expected: format!("{}.x", expected.major()),
        }),
        Some(_) => Ok(()),
    }
}

impl Conf {
    /// Schema version this document was rendered against.
    pub fn version(&self) -> IgnitionVersion {
        self.version
    }

    /// Borrow the underlying JSON document.
    pub fn as_value(&self) -> &Value {
        &self.doc
    }

    /// Enable console auto-login for the default user.
    pub fn add_autologin(&mut self) {
        for unit in autologin_units() {
            self.push_unit(unit);
        }
    }

    /// Declare a 9p share mounted at `guest_path` inside the guest.
    pub fn mount_9p(&mut self, guest_path: &str, read_only: bool) {
        self.push_unit(mount_unit(guest_path, read_only));
    }

    /// Authorize an SSH public key for `user`, creating the user entry if needed.
    pub fn add_authorized_key(&mut self, user: &str, key: &str) {
        let users = array_at(&mut self.doc["passwd"], "users");
        let key = Value::String(key.trim().to_string());

        let existing = users.iter().position(|u| u["name"] == user);
        match existing {
            Some(i) => {
                let keys = array_at(&mut users[i], "sshAuthorizedKeys");
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
            None => users.push(json!({ "name": user, "sshAuthorizedKeys": [key] })),
        }
    }

    /// Names of all systemd units declared in the document.
    pub fn unit_names(&self) -> Vec<&str> {
        self.doc
            .pointer("/systemd/units")
            .and_then(Value::as_array)
            .map(|units| {
                units
                    .iter()
                    .filter_map(|u| u.get("name").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Serialize the document for handing to the guest.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.doc)?)
    }

    /// Append a unit, merging drop-ins into an existing unit of the same name.
    fn push_unit(&mut self, unit: Value) {
        let units = self.units_mut();
        let position = units
            .iter()
            .position(|u| u.get("name").is_some() && u.get("name") == unit.get("name"));
        let dropins = unit.get("dropins").and_then(Value::as_array).cloned();

        match (position, dropins) {
            (Some(i), Some(dropins)) => array_at(&mut units[i], "dropins").extend(dropins),
            _ => units.push(unit),
        }
    }

    fn units_mut(&mut self) -> &mut Vec<Value> {
        // check_version guarantees the root is an object, so indexing inserts
        array_at(&mut self.doc["systemd"], "units")
    }
}

/// The array under `parent[key]`, creating the object and array as needed.
fn array_at<'a>(parent: &'a mut Value, key: &str) -> &'a mut Vec<Value> {
    if !parent.is_object() {
        *parent = json!({});
    }
    let slot = &mut parent[key];
    if !slot.is_array() {
        *slot = json!([]);
    }
    match slot {
        Value::Array(list) => list,
        _ => unreachable!("slot was just set to an array"),
    }
}
