/// Step identity computation
///
/// The id is a SHA-256 over, in this order:
/// 1. script content bytes
/// 2. settings sorted by key, each as `key=value`
/// 3. the base: a fixed tag when absent, `name+architecture` for an image,
///    or the base step's own id
/// 4. dependency ids in list order, each preceded by its position
///
/// Every field is framed with a tag and a length so that different field
/// sequences can never produce the same byte stream.
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::image::ImageRef;
use super::settings::Settings;

/// Deterministic content hash of a step (lowercase hex, 64 characters)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepId(String);

impl StepId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters, for log lines
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }

    /// Accept a string as an id only if it has the shape of one
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == 64 && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'));
        valid.then(|| Self(s.to_string()))
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The base as seen by the hash
pub enum BaseInput<'a> {
    Absent,
    Image(&'a ImageRef),
    Step(&'a StepId),
}

/// Compute the id of a step from its identity-relevant inputs
pub fn compute_step_id(
    script_content: &[u8],
    settings: &Settings,
    base: BaseInput<'_>,
    dependencies: &[&StepId],
) -> StepId {
    let mut hasher = Sha256::new();

    // 1. Script content
    frame(&mut hasher, b"script", script_content);

    // 2. Settings, sorted by key
    let sorted = settings.sorted();
    frame(&mut hasher, b"settings", &(sorted.len() as u64).to_le_bytes());
    for (key, value) in sorted {
        frame(&mut hasher, b"setting", format!("{key}={value}").as_bytes());
    }

    // 3. Base
    match base {
        BaseInput::Absent => frame(&mut hasher, b"base:none", b""),
        BaseInput::Image(image) => frame(
            &mut hasher,
            b"base:image",
            format!("{}+{}", image.name, image.architecture).as_bytes(),
        ),
        BaseInput::Step(id) => frame(&mut hasher, b"base:step", id.as_str().as_bytes()),
    }

    // 4. Dependencies, position-tagged
    frame(&mut hasher, b"deps", &(dependencies.len() as u64).to_le_bytes());
    for (position, id) in dependencies.iter().enumerate() {
        frame(&mut hasher, b"dep", &(position as u64).to_le_bytes());
        frame(&mut hasher, b"dep:id", id.as_str().as_bytes());
    }

    StepId(hex::encode(hasher.finalize()))
}

fn frame(hasher: &mut Sha256, tag: &[u8], bytes: &[u8]) {
    hasher.update(tag);
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::image::Architecture;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        Settings::from_pairs(pairs.iter().copied()).unwrap()
    }

    #[test]
    fn test_deterministic() {
        let a = compute_step_id(b"echo", &settings(&[("A", "1")]), BaseInput::Absent, &[]);
        let b = compute_step_id(b"echo", &settings(&[("A", "1")]), BaseInput::Absent, &[]);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(StepId::parse(a.as_str()).is_some());
    }

    #[test]
    fn test_settings_order_irrelevant() {
        let a = compute_step_id(
            b"echo",
            &settings(&[("A", "1"), ("B", "2")]),
            BaseInput::Absent,
            &[],
        );
        let b = compute_step_id(
            b"echo",
            &settings(&[("B", "2"), ("A", "1")]),
            BaseInput::Absent,
            &[],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_framing_prevents_ambiguity() {
        // "A=1" + "B=2" must not collide with a single value containing the boundary
        let a = compute_step_id(
            b"",
            &settings(&[("A", "1"), ("B", "2")]),
            BaseInput::Absent,
            &[],
        );
        let b = compute_step_id(b"", &settings(&[("A", "1B=2")]), BaseInput::Absent, &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_base_variants_differ() {
        let image = ImageRef::new("ubuntu", Architecture::X86_64);
        let other_arch = ImageRef::new("ubuntu", Architecture::Aarch64);
        let base_id = compute_step_id(b"base", &Settings::new(), BaseInput::Absent, &[]);

        let none = compute_step_id(b"x", &Settings::new(), BaseInput::Absent, &[]);
        let with_image = compute_step_id(b"x", &Settings::new(), BaseInput::Image(&image), &[]);
        let with_arch =
            compute_step_id(b"x", &Settings::new(), BaseInput::Image(&other_arch), &[]);
        let with_step = compute_step_id(b"x", &Settings::new(), BaseInput::Step(&base_id), &[]);

        assert_ne!(none, with_image);
        assert_ne!(with_image, with_arch);
        assert_ne!(none, with_step);
    }

    #[test]
    fn test_dependency_order_matters() {
        let d1 = compute_step_id(b"d1", &Settings::new(), BaseInput::Absent, &[]);
        let d2 = compute_step_id(b"d2", &Settings::new(), BaseInput::Absent, &[]);

        let forward = compute_step_id(b"x", &Settings::new(), BaseInput::Absent, &[&d1, &d2]);
        let backward = compute_step_id(b"x", &Settings::new(), BaseInput::Absent, &[&d2, &d1]);
        assert_ne!(forward, backward);
    }
}
