//! Kind-specific preparation after a resource is attached.
//!
//! Only volumes need work: a freshly created volume gets a filesystem, and
//! every volume gets mounted and listed in fstab. Formatting never runs on a
//! reattached volume because it would destroy its data.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use zoneclaim_reconcile::RetryPolicy;

use crate::error::ProvisionError;
use crate::model::{ResourceDescriptor, ResourceKind};

/// Post-attach preparation hook.
#[async_trait]
pub trait Initializer: Send + Sync {
    /// Prepare an attached resource. `fresh` is true only for a resource
    /// this run created.
    async fn prepare(&self, resource: &ResourceDescriptor, fresh: bool) -> Result<(), ProvisionError>;
}

/// Does nothing. Used for interfaces and addresses, and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInitializer;

#[async_trait]
impl Initializer for NoopInitializer {
    async fn prepare(&self, _resource: &ResourceDescriptor, _fresh: bool) -> Result<(), ProvisionError> {
        Ok(())
    }
}

/// Where and how a volume is mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeLayout {
    pub device: String,
    pub filesystem: String,
    pub mount_dir: PathBuf,
    pub fstab: PathBuf,
}

impl Default for VolumeLayout {
    fn default() -> Self {
        Self {
            device: "/dev/xvdb".to_string(),
            filesystem: "ext4".to_string(),
            mount_dir: PathBuf::from("/data"),
            fstab: PathBuf::from("/etc/fstab"),
        }
    }
}

impl VolumeLayout {
    /// fstab entry for this layout.
    pub fn fstab_line(&self) -> String {
        format!(
            "{} {} {} defaults,nofail 0 2",
            self.device,
            self.mount_dir.display(),
            self.filesystem
        )
    }
}

/// Formats, mounts, and records volumes using the system tools.
#[derive(Debug, Clone)]
pub struct FilesystemInitializer {
    layout: VolumeLayout,
    mkfs_retry: RetryPolicy,
}

impl FilesystemInitializer {
    pub fn new(layout: VolumeLayout) -> Self {
        Self {
            layout,
            mkfs_retry: RetryPolicy::new(2, Duration::from_secs(5), Duration::from_secs(5)),
        }
    }

    async fn make_filesystem(&self) -> Result<(), ProvisionError> {
        let args = &["-t", self.layout.filesystem.as_str(), self.layout.device.as_str()];
        let result = self
            .mkfs_retry
            .run("mkfs", |e: &String| !e.contains("is mounted"), move || run("mkfs", args))
            .await;

        match result {
            Ok(()) => {
                info!(device = %self.layout.device, filesystem = %self.layout.filesystem, "Created filesystem");
                Ok(())
            }
            Err(output) if output.contains("is mounted") => {
                debug!(device = %self.layout.device, "Device already mounted, skipping mkfs");
                Ok(())
            }
            Err(output) => Err(ProvisionError::Init(format!("mkfs failed: {output}"))),
        }
    }

    async fn mount(&self) -> Result<(), ProvisionError> {
        let dir = &self.layout.mount_dir;
        fs::create_dir_all(dir)
            .map_err(|e| ProvisionError::Init(format!("failed to create {}: {e}", dir.display())))?;

        let dir = dir.display().to_string();
        let args = [
            self.layout.device.as_str(),
            dir.as_str(),
            "-t",
            self.layout.filesystem.as_str(),
        ];
        match run("mount", &args).await {
            Ok(()) => {
                info!(device = %self.layout.device, mount_dir = %dir, "Mounted volume");
                Ok(())
            }
            Err(output) if output.contains("already mounted") => {
                debug!(device = %self.layout.device, mount_dir = %dir, "Volume already mounted");
                Ok(())
            }
            Err(output) => Err(ProvisionError::Init(format!("mount failed: {output}"))),
        }
    }
}

#[async_trait]
impl Initializer for FilesystemInitializer {
    async fn prepare(&self, resource: &ResourceDescriptor, fresh: bool) -> Result<(), ProvisionError> {
        if resource.kind != ResourceKind::Volume {
            return Ok(());
        }

        if fresh {
            self.make_filesystem().await?;
        } else {
            debug!(resource_id = %resource.id, "Reattached volume, not formatting");
        }
        self.mount().await?;

        let added = update_fstab(&self.layout.fstab, &self.layout.fstab_line())
            .map_err(|e| ProvisionError::Init(format!("failed to update fstab: {e}")))?;
        if added {
            info!(fstab = %self.layout.fstab.display(), "Added fstab entry");
        }
        Ok(())
    }
}

/// Run a command, returning its combined output on failure.
async fn run(program: &str, args: &[&str]) -> Result<(), String> {
    debug!(program, args = ?args, "Running command");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| format!("failed to execute {program}: {e}"))?;

    if output.status.success() {
        return Ok(());
    }

    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    warn!(program, status = %output.status, output = %combined.trim(), "Command failed");
    Err(format!("{program} {}: {}", args.join(" "), combined.trim()))
}

/// Append `line` to the fstab at `path` unless an entry for the same device
/// and mount point exists. Returns true if the file changed.
pub fn update_fstab(path: &Path, line: &str) -> io::Result<bool> {
    let existing = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let key: Vec<&str> = line.split_whitespace().take(2).collect();
    let present = existing
        .lines()
        .filter(|l| !l.trim_start().starts_with('#'))
        .any(|l| l.split_whitespace().take(2).eq(key.iter().copied()));
    if present {
        return Ok(false);
    }

    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(line);
    content.push('\n');

    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    fs::write(&tmp, &content)?;
    fs::rename(&tmp, path)?;
    Ok(true)
}
