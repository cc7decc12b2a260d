use std::path::{Path, PathBuf};

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Default interpreter for plugin scripts (e.g. `"sh"` / `"bash"`).
    fn default_shell() -> &'static str;

    /// Build a **tokio** `Command` that runs `script_path` through `interpreter`,
    /// or through the platform shell when no interpreter is given.
    fn script_command(interpreter: Option<&str>, script_path: &Path) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(interpreter.unwrap_or(Self::default_shell()));
        cmd.arg(script_path);
        cmd
    }

    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Root data directory.
    /// Unix: `~/.squidbot`, Windows: `%APPDATA%\squidbot`.
    fn data_dir() -> PathBuf;
}

/// `SQUID_DATA_DIR` wins over the platform default.
pub(crate) fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var("SQUID_DATA_DIR") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => default,
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;
