/// Script files and how to launch them
///
/// The script's content is read once at construction; that snapshot is what
/// identity hashes, even if the file changes on disk afterwards.
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConstructionError;

/// How a script is launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptKind {
    /// Run through an interpreter, e.g. `bash script.sh`
    Interpreted { program: String, args: Vec<String> },
    /// Executed directly
    Executable,
}

impl ScriptKind {
    /// Choose the launcher from the file extension, falling back to the shebang
    pub fn detect(path: &Path, content: &[u8]) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("sh") | Some("bash") => return Self::interpreter("bash"),
            Some("py") => return Self::interpreter("python3"),
            _ => {}
        }

        let first_line = content.split(|b| *b == b'\n').next().unwrap_or_default();
        match parse_shebang(&String::from_utf8_lossy(first_line)) {
            Some((program, args)) => Self::Interpreted { program, args },
            None => Self::Executable,
        }
    }

    fn interpreter(program: &str) -> Self {
        Self::Interpreted {
            program: program.to_string(),
            args: Vec::new(),
        }
    }
}

/// Parse `#!/usr/bin/env -S python3 -u` style lines into program and args
fn parse_shebang(line: &str) -> Option<(String, Vec<String>)> {
    let rest = line.strip_prefix("#!")?.trim();
    let mut parts = rest.split_whitespace();
    let first = parts.next()?;

    let mut remaining: Vec<&str> = parts.collect();

    let program = if Path::new(first).file_name().and_then(|n| n.to_str()) == Some("env") {
        // Skip env's own flags (e.g. -S)
        while remaining.first().is_some_and(|p| p.starts_with('-')) {
            remaining.remove(0);
        }
        if remaining.is_empty() {
            return None;
        }
        remaining.remove(0).to_string()
    } else {
        // Use the bare program name so it resolves on PATH and inside containers
        Path::new(first)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(first)
            .to_string()
    };

    Some((program, remaining.into_iter().map(String::from).collect()))
}

/// A script file together with its content at construction time
#[derive(Debug, Clone)]
pub struct Script {
    path: PathBuf,
    content: Vec<u8>,
    kind: ScriptKind,
}

impl Script {
    /// Read a script from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConstructionError> {
        let path = path.as_ref();
        let content = fs::read(path).map_err(|source| ConstructionError::UnreadableScript {
            path: path.to_path_buf(),
            source,
        })?;
        let kind = ScriptKind::detect(path, &content);

        Ok(Self {
            path: path.to_path_buf(),
            content,
            kind,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn kind(&self) -> &ScriptKind {
        &self.kind
    }

    /// File name used when the script is copied into a container
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "script".to_string())
    }
}
