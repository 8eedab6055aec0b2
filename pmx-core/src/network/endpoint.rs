//! Service endpoint descriptors and pipe discovery.
//!
//! Hosts advertise themselves under the pipe name `pmx.<service>.<host>`:
//!
//! - Windows: `\\.\pipe\pmx.<service>.<host>`
//! - Unix: `<pipe dir>/pmx.<service>.<host>.sock`, where the pipe dir is
//!   `$PMX_PIPE_DIR`, else `$XDG_RUNTIME_DIR/pmx`, else `<tmp>/pmx`.
//!
//! Discovery is a directory listing filtered by that convention.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Prefix shared by every PMX pipe name.
pub const PIPE_PREFIX: &str = "pmx.";

#[cfg(unix)]
const SOCKET_SUFFIX: &str = ".sock";

/// Identifies a discoverable host before a connection exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Machine the host runs on.
    pub host: String,
    /// Logical service name.
    pub name: String,
    /// Filesystem / pipe-namespace path to open.
    pub path: PathBuf,
}

impl Endpoint {
    pub fn new(name: &str, host: &str, dir: &Path) -> Self {
        let name = sanitize(name, true);
        let host = sanitize(host, false);
        let path = dir.join(file_name(&format!("{PIPE_PREFIX}{name}.{host}")));
        Self { host, name, path }
    }

    /// The endpoint `service` would use on this machine.
    pub fn local(service: &str) -> Self {
        Self::new(service, &local_host_name(), &default_pipe_dir())
    }

    /// `pmx.<service>.<host>`.
    pub fn pipe_name(&self) -> String {
        format!("{PIPE_PREFIX}{}.{}", self.name, self.host)
    }

    /// Parse a directory entry name back into an endpoint.
    pub fn from_file_name(entry: &str, dir: &Path) -> Option<Self> {
        #[cfg(unix)]
        let entry = entry.strip_suffix(SOCKET_SUFFIX)?;
        let rest = entry.strip_prefix(PIPE_PREFIX)?;
        let (name, host) = rest.split_once('.')?;
        if name.is_empty() || host.is_empty() {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            name: name.to_string(),
            path: dir.join(file_name(entry)),
        })
    }

    /// Interpret a user-supplied pipe reference that names one pipe
    /// directly: a path, or a full `pmx.<service>.<host>` name.
    ///
    /// Bare service names return `None`; they go through discovery.
    pub fn from_reference(reference: &str, dir: &Path) -> Option<Self> {
        let reference = reference.trim();
        if reference.contains('/') || reference.contains('\\') {
            let path = PathBuf::from(reference);
            let file = path.file_name()?.to_str()?.to_string();
            let parent = path.parent().unwrap_or(dir).to_path_buf();
            return Self::from_file_name(&file, &parent).or_else(|| {
                Some(Self {
                    host: local_host_name(),
                    name: file,
                    path,
                })
            });
        }
        if reference.starts_with(PIPE_PREFIX) {
            #[cfg(unix)]
            let entry = format!("{reference}{SOCKET_SUFFIX}");
            #[cfg(not(unix))]
            let entry = reference.to_string();
            return Self::from_file_name(&entry, dir);
        }
        None
    }

    /// Whether `wanted` refers to this endpoint by service name, pipe name
    /// or path.
    pub fn matches(&self, wanted: &str) -> bool {
        let wanted = wanted.trim();
        self.name.eq_ignore_ascii_case(wanted)
            || self.pipe_name() == wanted
            || self.path == Path::new(wanted)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.pipe_name(), self.path.display())
    }
}

// ── Discovery ────────────────────────────────────────────────────

/// Enumerate the PMX pipes present in `dir`, sorted by service then host.
pub fn discover(dir: &Path) -> Vec<Endpoint> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), "pipe discovery skipped: {e}");
            return Vec::new();
        }
    };

    let mut found: Vec<Endpoint> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name();
            Endpoint::from_file_name(name.to_str()?, dir)
        })
        .collect();
    found.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.host.cmp(&b.host)));
    found.dedup();
    found
}

/// Narrow discovered candidates to `wanted`, or keep all of them (in
/// order, for first-available selection) when nothing was asked for.
pub fn select(candidates: Vec<Endpoint>, wanted: Option<&str>) -> Vec<Endpoint> {
    match wanted.map(str::trim).filter(|w| !w.is_empty()) {
        None => candidates,
        Some(wanted) => candidates
            .into_iter()
            .filter(|c| c.matches(wanted))
            .collect(),
    }
}

// ── Naming helpers ───────────────────────────────────────────────

/// Directory (or pipe namespace) holding PMX pipes on this machine.
pub fn default_pipe_dir() -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from(r"\\.\pipe\")
    }
    #[cfg(not(windows))]
    {
        if let Some(dir) = std::env::var_os("PMX_PIPE_DIR").filter(|d| !d.is_empty()) {
            return PathBuf::from(dir);
        }
        if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR").filter(|d| !d.is_empty()) {
            return PathBuf::from(dir).join("pmx");
        }
        std::env::temp_dir().join("pmx")
    }
}

/// Best-effort host name used in pipe names.
pub fn local_host_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .map(|h| h.trim().to_string())
        .find(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn file_name(pipe_name: &str) -> String {
    #[cfg(unix)]
    {
        format!("{pipe_name}{SOCKET_SUFFIX}")
    }
    #[cfg(not(unix))]
    {
        pipe_name.to_string()
    }
}

/// Replace characters that would break the naming convention. Service
/// names may not contain dots since the first dot separates the host.
fn sanitize(raw: &str, is_service: bool) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | ' ' => '-',
            '.' if is_service => '-',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_name_convention() {
        let dir = PathBuf::from("/run/pmx");
        let ep = Endpoint::new("billing", "db-01", &dir);
        assert_eq!(ep.pipe_name(), "pmx.billing.db-01");
        assert!(ep.path.starts_with(&dir));
    }

    #[test]
    fn service_dots_are_replaced() {
        let ep = Endpoint::new("my.service", "host.example.com", Path::new("/tmp"));
        assert_eq!(ep.name, "my-service");
        assert_eq!(ep.host, "host.example.com");
    }

    #[cfg(unix)]
    #[test]
    fn parses_file_names_back() {
        let dir = Path::new("/tmp/pmx");
        let ep = Endpoint::from_file_name("pmx.jobs.box.lan.sock", dir).unwrap();
        assert_eq!(ep.name, "jobs");
        assert_eq!(ep.host, "box.lan");
        assert_eq!(ep.path, dir.join("pmx.jobs.box.lan.sock"));

        assert!(Endpoint::from_file_name("other.sock", dir).is_none());
        assert!(Endpoint::from_file_name("pmx.jobs.box", dir).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn discovery_lists_matching_pipes_only() {
        let dir = std::env::temp_dir().join(format!("pmx-discover-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["pmx.beta.h1.sock", "pmx.alpha.h1.sock", "unrelated.sock"] {
            std::fs::write(dir.join(name), b"").unwrap();
        }

        let found = discover(&dir);
        let names: Vec<_> = found.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        let picked = select(found.clone(), Some("beta"));
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "beta");
        assert_eq!(select(found, None).len(), 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_directory_discovers_nothing() {
        assert!(discover(Path::new("/definitely/not/a/pmx/dir")).is_empty());
    }

    #[test]
    fn bare_service_names_are_not_direct_references() {
        assert!(Endpoint::from_reference("jobs", Path::new("/tmp")).is_none());
        let ep = Endpoint::from_reference("pmx.jobs.box", Path::new("/tmp")).unwrap();
        assert_eq!(ep.name, "jobs");
        assert!(ep.matches("pmx.jobs.box"));
        assert!(ep.matches("JOBS"));
    }
}
