/// CLI utilities for consistent output formatting
use std::io::IsTerminal;

/// Colored `[buildstep]` prefix when stderr is a TTY, plain otherwise
pub fn buildstep_prefix() -> &'static str {
    if std::io::stderr().is_terminal() {
        "\x1b[96m[buildstep]\x1b[0m"
    } else {
        "[buildstep]"
    }
}

/// Human-readable byte size
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}
