/// External container images a step can be based on
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConstructionError;

/// CPU architecture of a container image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    #[serde(rename = "x86_64")]
    X86_64,
    Aarch64,
    Armv7,
}

impl Architecture {
    /// Platform string understood by `docker --platform`
    pub fn docker_platform(&self) -> &'static str {
        match self {
            Self::X86_64 => "linux/amd64",
            Self::Aarch64 => "linux/arm64",
            Self::Armv7 => "linux/arm/v7",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
            Self::Armv7 => "armv7",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = ConstructionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" | "amd64" => Ok(Self::X86_64),
            "aarch64" | "arm64" => Ok(Self::Aarch64),
            "armv7" | "arm" => Ok(Self::Armv7),
            other => Err(ConstructionError::UnknownArchitecture(other.to_string())),
        }
    }
}

/// Reference to an image that is pulled, never built, by the engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub name: String,
    pub architecture: Architecture,
}

impl ImageRef {
    pub fn new(name: impl Into<String>, architecture: Architecture) -> Self {
        Self {
            name: name.into(),
            architecture,
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.architecture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_architecture_aliases() {
        assert_eq!("amd64".parse::<Architecture>().unwrap(), Architecture::X86_64);
        assert_eq!("arm64".parse::<Architecture>().unwrap(), Architecture::Aarch64);
        assert!("sparc".parse::<Architecture>().is_err());
    }

    #[test]
    fn test_image_ref_equality() {
        let a = ImageRef::new("debian:bullseye", Architecture::X86_64);
        let b = ImageRef::new("debian:bullseye", Architecture::Aarch64);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }
}
