//! Persistent search path registration.
//!
//! Installed tools are made available to new shells and processes by
//! appending their binary directory to the user's persistent search path.
//! The running process environment is never changed.
//!
//! Where that value lives is platform specific and hidden behind
//! [`PathStore`]:
//!
//! - Windows: the user-scoped `PATH` environment variable
//! - Unix: a managed env script that shell profiles source
//! - [`MemoryPathStore`]: in-memory, for tests and dry runs

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::error::{InstallError, InstallResult};

/// Returns the PATH separator for the current platform.
#[inline]
pub fn path_separator() -> &'static str {
    #[cfg(windows)]
    {
        ";"
    }
    #[cfg(not(windows))]
    {
        ":"
    }
}

// ============================================================================
// Path Stores
// ============================================================================

/// Backing storage of the persistent user search path.
pub trait PathStore: Send + Sync {
    /// Human-readable location, used in logs.
    fn describe(&self) -> String;

    /// Reads the current persistent value (entries joined by the separator).
    fn read(&self) -> InstallResult<String>;

    /// Replaces the persistent value.
    fn write(&self, value: &str) -> InstallResult<()>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryPathStore {
    value: Mutex<String>,
}

impl MemoryPathStore {
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            value: Mutex::new(initial.into()),
        }
    }

    /// Current value split into entries.
    pub fn entries(&self) -> Vec<String> {
        split_entries(&self.value_now())
    }

    fn value_now(&self) -> String {
        self.value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl PathStore for MemoryPathStore {
    fn describe(&self) -> String {
        "in-memory search path".to_string()
    }

    fn read(&self) -> InstallResult<String> {
        Ok(self.value_now())
    }

    fn write(&self, value: &str) -> InstallResult<()> {
        *self
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = value.to_string();
        Ok(())
    }
}

/// Managed env script holding the entries toolnest added.
///
/// The script contains a single `export PATH=...` line that appends the
/// managed entries to whatever PATH the shell already has. Users source it
/// from their shell profile.
#[derive(Debug, Clone)]
pub struct ProfilePathStore {
    script: PathBuf,
}

const PROFILE_HEADER: &str = "# Managed by toolnest. Source this file from your shell profile.";
const PROFILE_PREFIX: &str = "export PATH=\"$PATH:";

impl ProfilePathStore {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
        }
    }

    /// Default script location: `{config_dir}/toolnest/env.sh`.
    pub fn default_location() -> InstallResult<Self> {
        let config = dirs::config_dir().ok_or_else(|| {
            InstallError::Registration("No per-user config directory is available".to_string())
        })?;
        Ok(Self::new(config.join("toolnest").join("env.sh")))
    }

    pub fn script(&self) -> &Path {
        &self.script
    }
}

impl PathStore for ProfilePathStore {
    fn describe(&self) -> String {
        format!("env script {}", self.script.display())
    }

    fn read(&self) -> InstallResult<String> {
        let content = match fs::read_to_string(&self.script) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => {
                return Err(InstallError::Registration(format!(
                    "Failed to read {}: {}",
                    self.script.display(),
                    e
                )))
            }
        };

        Ok(content
            .lines()
            .find_map(|line| {
                line.trim()
                    .strip_prefix(PROFILE_PREFIX)
                    .and_then(|rest| rest.strip_suffix('"'))
            })
            .map(unescape_shell)
            .unwrap_or_default())
    }

    fn write(&self, value: &str) -> InstallResult<()> {
        if let Some(parent) = self.script.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                InstallError::Registration(format!(
                    "Failed to create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let escaped = value
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('$', "\\$")
            .replace('`', "\\`");
        let content = format!("{}\n{}{}\"\n", PROFILE_HEADER, PROFILE_PREFIX, escaped);

        fs::write(&self.script, content).map_err(|e| {
            InstallError::Registration(format!(
                "Failed to write {}: {}",
                self.script.display(),
                e
            ))
        })
    }
}

/// Reverses the backslash escaping applied by [`ProfilePathStore::write`].
fn unescape_shell(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// A user-scoped environment variable, read and written through PowerShell.
///
/// PowerShell writes its output in the console code page unless told
/// otherwise, so every script switches stdout to UTF-8 first. Non-ASCII
/// directories would otherwise come back mangled and be written back that way.
#[cfg(windows)]
#[derive(Debug, Clone)]
pub struct WindowsUserPath {
    variable: String,
}

#[cfg(windows)]
impl Default for WindowsUserPath {
    fn default() -> Self {
        Self::for_variable("PATH")
    }
}

#[cfg(windows)]
impl WindowsUserPath {
    /// Store backed by another user variable instead of `PATH`.
    pub fn for_variable(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
        }
    }

    fn powershell(script: &str) -> InstallResult<String> {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;

        let script = format!(
            "[Console]::OutputEncoding = [System.Text.Encoding]::UTF8; {}",
            script
        );
        let output = std::process::Command::new("powershell.exe")
            .args(["-NoProfile", "-NonInteractive", "-Command", &script])
            .creation_flags(CREATE_NO_WINDOW)
            .output()
            .map_err(|e| InstallError::Registration(format!("Failed to run PowerShell: {}", e)))?;

        if !output.status.success() {
            return Err(InstallError::Registration(format!(
                "PowerShell exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8(output.stdout).map_err(|e| {
            InstallError::Registration(format!("PowerShell output is not valid UTF-8: {}", e))
        })?;
        Ok(stdout.trim_start_matches('\u{feff}').trim().to_string())
    }
}

#[cfg(windows)]
impl PathStore for WindowsUserPath {
    fn describe(&self) -> String {
        format!("user {} environment variable", self.variable)
    }

    fn read(&self) -> InstallResult<String> {
        Self::powershell(&format!(
            "[Environment]::GetEnvironmentVariable('{}', 'User')",
            self.variable.replace('\'', "''")
        ))
    }

    fn write(&self, value: &str) -> InstallResult<()> {
        Self::powershell(&format!(
            "[Environment]::SetEnvironmentVariable('{}', '{}', 'User')",
            self.variable.replace('\'', "''"),
            value.replace('\'', "''")
        ))
        .map(|_| ())
    }
}

/// Returns the store for the current platform.
pub fn system_path_store() -> InstallResult<Arc<dyn PathStore>> {
    #[cfg(windows)]
    {
        Ok(Arc::new(WindowsUserPath::default()))
    }
    #[cfg(not(windows))]
    {
        Ok(Arc::new(ProfilePathStore::default_location()?))
    }
}

// ============================================================================
// Registrar
// ============================================================================

/// Result of a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRegistration {
    /// Absolute directory that was registered.
    pub dir: PathBuf,
    /// False when the entry was already present and dedupe skipped it.
    pub appended: bool,
}

/// Appends tool directories to the persistent search path.
///
/// Registrations are serialized so concurrent installs cannot lose each
/// other's read-modify-write.
pub struct PathRegistrar {
    store: Arc<dyn PathStore>,
    dedupe: bool,
    write_lock: Mutex<()>,
}

impl PathRegistrar {
    pub fn new(store: Arc<dyn PathStore>, dedupe: bool) -> Self {
        Self {
            store,
            dedupe,
            write_lock: Mutex::new(()),
        }
    }

    /// Appends `bin_dir` (made absolute) to the persistent search path.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::Registration`] if the directory cannot be
    /// resolved or the store cannot be read or written.
    pub fn register(&self, bin_dir: &Path) -> InstallResult<PathRegistration> {
        let dir = std::path::absolute(bin_dir).map_err(|e| {
            InstallError::Registration(format!(
                "Failed to resolve {}: {}",
                bin_dir.display(),
                e
            ))
        })?;
        let entry = dir.to_str().ok_or_else(|| {
            InstallError::Registration(format!("Path is not valid UTF-8: {}", dir.display()))
        })?;

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let current = self.store.read()?;
        let Some(updated) = append_entry(&current, entry, self.dedupe) else {
            debug!("{} already on {}", entry, self.store.describe());
            return Ok(PathRegistration {
                dir,
                appended: false,
            });
        };

        self.store.write(&updated)?;
        info!("Added {} to {}", entry, self.store.describe());

        Ok(PathRegistration {
            dir,
            appended: true,
        })
    }
}

/// Splits a search path value into non-empty entries.
pub fn split_entries(value: &str) -> Vec<String> {
    value
        .split(path_separator())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Returns `current` with `entry` appended, or `None` when dedupe finds it.
pub fn append_entry(current: &str, entry: &str, dedupe: bool) -> Option<String> {
    if dedupe && split_entries(current).iter().any(|e| same_entry(e, entry)) {
        return None;
    }

    let trimmed = current.trim_end_matches(path_separator());
    if trimmed.is_empty() {
        Some(entry.to_string())
    } else {
        Some(format!("{}{}{}", trimmed, path_separator(), entry))
    }
}

fn same_entry(a: &str, b: &str) -> bool {
    let a = a.trim_end_matches(['/', '\\']);
    let b = b.trim_end_matches(['/', '\\']);
    if cfg!(windows) {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_path_separator() {
        let sep = path_separator();
        #[cfg(windows)]
        assert_eq!(sep, ";");
        #[cfg(not(windows))]
        assert_eq!(sep, ":");
    }

    #[test]
    fn test_append_entry() {
        let sep = path_separator();
        assert_eq!(append_entry("", "/a", true), Some("/a".to_string()));
        assert_eq!(
            append_entry(&format!("/x{}", sep), "/a", true),
            Some(format!("/x{}/a", sep))
        );
        assert_eq!(append_entry("/a", "/a/", true), None);
        assert_eq!(
            append_entry("/a", "/a", false),
            Some(format!("/a{}/a", sep))
        );
    }

    #[test]
    fn test_register_appends_absolute_dir() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryPathStore::new("/usr/bin"));
        let registrar = PathRegistrar::new(store.clone(), true);
        let bin = temp_dir.path().join("cmake").join("bin");

        let registration = registrar.register(&bin).unwrap();

        assert!(registration.appended);
        assert_eq!(registration.dir, bin);
        assert_eq!(
            store.entries(),
            vec!["/usr/bin".to_string(), bin.to_string_lossy().into_owned()]
        );
    }

    #[test]
    fn test_register_twice_dedupes() {
        let store = Arc::new(MemoryPathStore::default());
        let registrar = PathRegistrar::new(store.clone(), true);
        let bin = std::env::temp_dir().join("tool-bin");

        assert!(registrar.register(&bin).unwrap().appended);
        assert!(!registrar.register(&bin).unwrap().appended);
        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn test_register_twice_without_dedupe_appends_again() {
        let store = Arc::new(MemoryPathStore::default());
        let registrar = PathRegistrar::new(store.clone(), false);
        let bin = std::env::temp_dir().join("tool-bin");

        registrar.register(&bin).unwrap();
        registrar.register(&bin).unwrap();
        assert_eq!(store.entries().len(), 2);
    }

    #[test]
    fn test_concurrent_registrations_keep_every_entry() {
        let store = Arc::new(MemoryPathStore::default());
        let registrar = Arc::new(PathRegistrar::new(store.clone(), true));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registrar = registrar.clone();
                std::thread::spawn(move || {
                    registrar
                        .register(&std::env::temp_dir().join(format!("tool-{}", i)))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.entries().len(), 8);
    }

    struct RejectingStore;

    impl PathStore for RejectingStore {
        fn describe(&self) -> String {
            "rejecting store".to_string()
        }
        fn read(&self) -> InstallResult<String> {
            Ok(String::new())
        }
        fn write(&self, _value: &str) -> InstallResult<()> {
            Err(InstallError::Registration("access denied".to_string()))
        }
    }

    #[test]
    fn test_register_surfaces_store_errors() {
        let registrar = PathRegistrar::new(Arc::new(RejectingStore), true);
        let err = registrar
            .register(&std::env::temp_dir().join("x"))
            .unwrap_err();
        assert_eq!(err.kind(), "RegistrationError");
    }

    #[cfg(not(windows))]
    #[test]
    fn test_profile_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = ProfilePathStore::new(temp_dir.path().join("toolnest").join("env.sh"));

        assert_eq!(store.read().unwrap(), "");
        store.write("/opt/a/bin:/opt/b").unwrap();
        assert_eq!(store.read().unwrap(), "/opt/a/bin:/opt/b");

        let script = fs::read_to_string(store.script()).unwrap();
        assert!(script.starts_with("# Managed by toolnest"));
        assert!(script.contains("export PATH=\"$PATH:/opt/a/bin:/opt/b\""));

        store.write("/opt/$odd \"dir\"").unwrap();
        assert_eq!(store.read().unwrap(), "/opt/$odd \"dir\"");
    }

    #[cfg(windows)]
    #[test]
    fn test_windows_store_keeps_non_ascii_entries() {
        let store = WindowsUserPath::for_variable(format!(
            "TOOLNEST_TEST_{}",
            std::process::id()
        ));
        let value = r"C:\Tools\bin;C:\工具\bin;C:\Users\Zoë\O'Neil";

        store.write(value).unwrap();
        let read = store.read();
        let _ = WindowsUserPath::powershell(&format!(
            "[Environment]::SetEnvironmentVariable('{}', $null, 'User')",
            store.variable
        ));

        assert_eq!(read.unwrap(), value);
    }
}
