use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "sage.toml";

/// Root of the medium SAGE runs from.
///
/// Resolution order: explicit `--root`, then the grandparent of the running
/// executable (`<root>/launcher/sage-launcher`), then the current directory.
pub fn medium_root(explicit: Option<&Path>) -> Result<PathBuf, std::io::Error> {
    if let Some(root) = explicit {
        return Ok(root.to_path_buf());
    }

    if let Ok(exe) = std::env::current_exe()
        && let Some(root) = medium_root_from_exe(&exe)
    {
        return Ok(root);
    }

    std::env::current_dir()
}

/// The directory two levels above the executable, unless the binary is
/// running out of a cargo `target/` directory.
pub fn medium_root_from_exe(exe_path: &Path) -> Option<PathBuf> {
    if exe_path.components().any(|c| c.as_os_str() == "target") {
        return None;
    }
    exe_path.parent()?.parent().map(Path::to_path_buf)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn logs_dir(root: &Path) -> PathBuf {
    root.join("logs")
}

/// The medium root itself. It exists for as long as the drive is mounted,
/// so a stock layout needs no marker file.
pub fn default_sentinel(root: &Path) -> PathBuf {
    root.to_path_buf()
}

/// Interpreter shipped on the medium for `program`, if there is one.
///
/// `python3`/`python` map to `<root>/python/bin/python3` (`python\python.exe`
/// on Windows) and `node` to `<root>/node/bin/node` (`node\node.exe`).
pub fn bundled_program(root: &Path, program: &str) -> Option<PathBuf> {
    let candidate = match program {
        "python" | "python3" if cfg!(windows) => root.join("python").join("python.exe"),
        "python" | "python3" => root.join("python").join("bin").join("python3"),
        "node" if cfg!(windows) => root.join("node").join("node.exe"),
        "node" => root.join("node").join("bin").join("node"),
        _ => return None,
    };
    candidate.is_file().then_some(candidate)
}

/// Resolve `path` against the medium root unless it is already absolute.
pub fn under_root(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn medium_root_from_exe_is_grandparent() {
        let exe = PathBuf::from("/media/usb/launcher/sage-launcher");
        assert_eq!(
            medium_root_from_exe(&exe),
            Some(PathBuf::from("/media/usb"))
        );
    }

    #[test]
    fn medium_root_from_exe_ignores_cargo_target() {
        let exe = PathBuf::from("/home/me/sage/target/debug/sage-launcher");
        assert_eq!(medium_root_from_exe(&exe), None);
    }

    #[test]
    fn explicit_root_wins() {
        let root = medium_root(Some(Path::new("/mnt/sage"))).unwrap();
        assert_eq!(root, PathBuf::from("/mnt/sage"));
    }

    #[test]
    fn derived_paths_live_under_root() {
        let root = Path::new("/mnt/sage");
        assert_eq!(config_path(root), PathBuf::from("/mnt/sage/sage.toml"));
        assert_eq!(logs_dir(root), PathBuf::from("/mnt/sage/logs"));
        assert_eq!(default_sentinel(root), PathBuf::from("/mnt/sage"));
        assert_eq!(
            under_root(root, Path::new("backend")),
            PathBuf::from("/mnt/sage/backend")
        );
        assert_eq!(under_root(root, Path::new("/opt/x")), PathBuf::from("/opt/x"));
    }

    #[test]
    fn bundled_program_only_when_present() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(bundled_program(tmp.path(), "python3"), None);
        assert_eq!(bundled_program(tmp.path(), "cargo"), None);

        let python = if cfg!(windows) {
            tmp.path().join("python").join("python.exe")
        } else {
            tmp.path().join("python").join("bin").join("python3")
        };
        std::fs::create_dir_all(python.parent().unwrap()).unwrap();
        std::fs::write(&python, "").unwrap();

        assert_eq!(bundled_program(tmp.path(), "python3"), Some(python.clone()));
        assert_eq!(bundled_program(tmp.path(), "python"), Some(python));
    }
}
