/// Step settings: the environment a script runs with
///
/// Insertion order is kept for display, but identity only ever sees the
/// entries sorted by key.
use crate::error::ConstructionError;

/// Prefix reserved for variables the engine injects itself
pub const RESERVED_PREFIX: &str = "STEP_";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    entries: Vec<(String, String)>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build settings from key/value pairs, rejecting duplicates and invalid keys
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConstructionError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut settings = Self::new();
        for (key, value) in pairs {
            settings.insert(key, value)?;
        }
        Ok(settings)
    }

    /// Add one entry
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ConstructionError> {
        let key = key.into();
        validate_key(&key)?;

        let value = value.into();
        if value.contains('\0') {
            return Err(ConstructionError::InvalidSetting {
                key,
                reason: "value contains NUL",
            });
        }

        if self.get(&key).is_some() {
            return Err(ConstructionError::DuplicateSetting(key));
        }

        self.entries.push((key, value));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Entries sorted by key
    pub fn sorted(&self) -> Vec<(&str, &str)> {
        let mut sorted: Vec<_> = self.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        sorted
    }
}

fn validate_key(key: &str) -> Result<(), ConstructionError> {
    if key.is_empty() {
        return Err(ConstructionError::InvalidSetting {
            key: key.to_string(),
            reason: "key is empty",
        });
    }

    if key.contains('=') || key.contains('\0') {
        return Err(ConstructionError::InvalidSetting {
            key: key.to_string(),
            reason: "key contains '=' or NUL",
        });
    }

    if key.starts_with(RESERVED_PREFIX) {
        return Err(ConstructionError::ReservedSetting(key.to_string()));
    }

    Ok(())
}
