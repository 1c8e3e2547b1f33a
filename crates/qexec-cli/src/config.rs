//! Host configuration for the qexec binary.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use std::path::{Path, PathBuf};

/// Host tool paths and directories.
#[derive(Debug, Clone)]
pub struct QexecConfig {
    /// QEMU system emulator.
    pub qemu_path: PathBuf,

    /// `qemu-img`, used to create disk overlays.
    pub qemu_img_path: PathBuf,

    /// `qemu-nbd`, used for NBD disks.
    pub qemu_nbd_path: PathBuf,

    /// `guestfish`, used for kernel arguments and config injection.
    pub guestfish_path: PathBuf,

    /// Parent directory for per-instance state.
    pub state_dir: PathBuf,

    /// Build working directory shared into development shells.
    pub workdir: Option<PathBuf>,

    /// SSH client used by development shells.
    pub ssh_path: PathBuf,

    /// User development shells log in as.
    pub ssh_user: String,
}

impl Default for QexecConfig {
    fn default() -> Self {
        Self {
            qemu_path: PathBuf::from("qemu-system-x86_64"),
            qemu_img_path: PathBuf::from("qemu-img"),
            qemu_nbd_path: PathBuf::from("qemu-nbd"),
            guestfish_path: PathBuf::from("guestfish"),
            state_dir: PathBuf::from("/tmp/qexec"),
            workdir: None,
            ssh_path: PathBuf::from("ssh"),
            ssh_user: qexec_conf::AUTOLOGIN_USER.to_string(),
        }
    }
}

impl QexecConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `QEXEC_QEMU` | `qemu-system-x86_64` |
    /// | `QEXEC_QEMU_IMG` | `qemu-img` |
    /// | `QEXEC_QEMU_NBD` | `qemu-nbd` |
    /// | `QEXEC_GUESTFISH` | `guestfish` |
    /// | `QEXEC_STATE_DIR` | `/tmp/qexec` |
    /// | `QEXEC_WORKDIR` | unset |
    /// | `QEXEC_SSH` | `ssh` |
    /// | `QEXEC_SSH_USER` | `core` |
    pub fn from_env() -> Self {
        let default = Self::default();
        let path = |var: &str, fallback: PathBuf| {
            std::env::var(var)
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(fallback)
        };

        Self {
            qemu_path: path("QEXEC_QEMU", default.qemu_path),
            qemu_img_path: path("QEXEC_QEMU_IMG", default.qemu_img_path),
            qemu_nbd_path: path("QEXEC_QEMU_NBD", default.qemu_nbd_path),
            guestfish_path: path("QEXEC_GUESTFISH", default.guestfish_path),
            state_dir: path("QEXEC_STATE_DIR", default.state_dir),
            workdir: std::env::var("QEXEC_WORKDIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            ssh_path: path("QEXEC_SSH", default.ssh_path),
            ssh_user: std::env::var("QEXEC_SSH_USER")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(default.ssh_user),
        }
    }

    /// Log warnings for tools that cannot be found.
    ///
    /// Nothing fails here: a missing tool only matters if the launch needs it.
    pub fn validate_warn(&self) {
        for (name, tool) in [
            ("qemu", &self.qemu_path),
            ("qemu-img", &self.qemu_img_path),
            ("qemu-nbd", &self.qemu_nbd_path),
            ("guestfish", &self.guestfish_path),
            ("ssh", &self.ssh_path),
        ] {
            if find_program(tool).is_none() {
                tracing::warn!(tool = name, path = %tool.display(), "Tool not found");
            }
        }

        if let Some(workdir) = &self.workdir {
            if !workdir.is_dir() {
                tracing::warn!(path = %workdir.display(), "Workdir is not a directory");
            }
        }
    }
}

/// Resolve `program` the way a shell would: paths as-is, names through `PATH`.
fn find_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QexecConfig::default();
        assert_eq!(config.qemu_path, PathBuf::from("qemu-system-x86_64"));
        assert_eq!(config.state_dir, PathBuf::from("/tmp/qexec"));
        assert_eq!(config.ssh_user, "core");
        assert!(config.workdir.is_none());
    }

    #[test]
    fn test_from_env_uses_defaults() {
        for var in [
            "QEXEC_QEMU",
            "QEXEC_QEMU_IMG",
            "QEXEC_QEMU_NBD",
            "QEXEC_GUESTFISH",
            "QEXEC_STATE_DIR",
            "QEXEC_WORKDIR",
            "QEXEC_SSH",
            "QEXEC_SSH_USER",
        ] {
            std::env::remove_var(var);
        }

        let config = QexecConfig::from_env();
        let default = QexecConfig::default();

        assert_eq!(config.qemu_path, default.qemu_path);
        assert_eq!(config.qemu_img_path, default.qemu_img_path);
        assert_eq!(config.state_dir, default.state_dir);
        assert_eq!(config.ssh_path, default.ssh_path);
        assert_eq!(config.workdir, None);
    }

    #[test]
    fn test_find_program() {
        assert!(find_program(Path::new("sh")).is_some());
        assert!(find_program(Path::new("/bin/sh")).is_some());
        assert!(find_program(Path::new("qexec-no-such-tool")).is_none());
        assert!(find_program(Path::new("/nonexistent/qemu")).is_none());
    }
}
