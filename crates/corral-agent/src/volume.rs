//! VolumeProvisioner — loopback-backed storage volumes.
//!
//! One volume per container: a fixed-size backing file formatted with
//! ext4 and loop-mounted under the storage root. Creation is guarded by
//! full rollback of completed steps; removal is best-effort and always
//! attempts every step, aggregating failures into a [`TeardownReport`].
//! Presence is derived from the directory listing, never recorded.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use corral_store::Volume;

use crate::error::{AgentError, AgentResult, TeardownReport};
use crate::exec::{Cmd, Exec};

const BYTES_PER_GIB: u64 = 1024 * 1024 * 1024;

/// How far a create attempt got, for rollback.
#[derive(Default)]
struct CreateProgress {
    dir_created: bool,
    file_allocated: bool,
    mounted: bool,
    step: &'static str,
}

/// Provisions loopback-backed volumes under a storage root directory.
pub struct VolumeProvisioner {
    root: PathBuf,
    exec: Arc<dyn Exec>,
}

impl VolumeProvisioner {
    pub fn new(root: impl Into<PathBuf>, exec: Arc<dyn Exec>) -> Self {
        Self {
            root: root.into(),
            exec,
        }
    }

    /// Mount point for a volume ID (one subdirectory of the root).
    pub fn mount_point(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Backing file for a volume ID, next to its mount point.
    pub fn backing_file(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.img"))
    }

    /// Create a volume: mkdir → allocate backing file → mkfs.ext4 →
    /// loop mount → drop `lost+found`. Any step's failure rolls back
    /// every completed step in reverse order and returns the original
    /// error wrapped with the failing step.
    pub async fn create(&self, id: &str, size_gb: u64) -> AgentResult<Volume> {
        let mount = self.mount_point(id);
        if mount.exists() {
            return Err(AgentError::VolumeExists(id.to_string()));
        }

        let mut progress = CreateProgress::default();
        match self.try_create(id, size_gb, &mut progress).await {
            Ok(()) => {
                info!(%id, size_gb, mount = %mount.display(), "volume created");
                Ok(Volume {
                    id: id.to_string(),
                    mount_point: mount,
                    size_limit_gb: size_gb,
                })
            }
            Err(e) => {
                self.rollback(id, &progress).await;
                Err(AgentError::Provision {
                    id: id.to_string(),
                    step: progress.step,
                    source: Box::new(e),
                })
            }
        }
    }

    async fn try_create(
        &self,
        id: &str,
        size_gb: u64,
        progress: &mut CreateProgress,
    ) -> AgentResult<()> {
        let mount = self.mount_point(id);
        let backing = self.backing_file(id);

        progress.step = "mkdir";
        fs::create_dir_all(&mount).map_err(|e| AgentError::io(mount.display(), e))?;
        progress.dir_created = true;

        progress.step = "allocate";
        self.exec
            .run_checked(
                &Cmd::new("fallocate")
                    .arg("-l")
                    .arg(format!("{size_gb}G"))
                    .arg(path_str(&backing)),
            )
            .await?;
        progress.file_allocated = true;

        progress.step = "mkfs";
        self.exec
            .run_checked(&Cmd::new("mkfs.ext4").args(["-q", "-F"]).arg(path_str(&backing)))
            .await?;

        progress.step = "mount";
        self.exec
            .run_checked(
                &Cmd::new("mount")
                    .args(["-o", "loop"])
                    .arg(path_str(&backing))
                    .arg(path_str(&mount)),
            )
            .await?;
        progress.mounted = true;

        // ext4 seeds the filesystem with lost+found; drop it so the
        // volume appears empty to consumers.
        progress.step = "clean lost+found";
        let lost_found = mount.join("lost+found");
        if lost_found.exists() {
            fs::remove_dir_all(&lost_found).map_err(|e| AgentError::io(lost_found.display(), e))?;
        }

        Ok(())
    }

    /// Undo completed create steps in reverse order. Each undo is
    /// attempted regardless of earlier undo failures.
    async fn rollback(&self, id: &str, progress: &CreateProgress) {
        let mount = self.mount_point(id);
        let backing = self.backing_file(id);
        warn!(%id, step = progress.step, "volume creation failed, rolling back");

        if progress.mounted
            && let Err(e) = self.exec.run_checked(&Cmd::new("umount").arg(path_str(&mount))).await
        {
            warn!(%id, error = %e, "rollback unmount failed");
        }
        if progress.file_allocated
            && let Err(e) = fs::remove_file(&backing)
        {
            warn!(%id, error = %e, "rollback backing file removal failed");
        }
        if progress.dir_created
            && let Err(e) = fs::remove_dir_all(&mount)
        {
            warn!(%id, error = %e, "rollback mount point removal failed");
        }
    }

    /// Remove a volume. A missing directory is an error; otherwise
    /// unmount, directory removal, and backing-file removal are all
    /// attempted even if earlier steps fail, to maximize reclamation.
    pub async fn remove(&self, id: &str) -> AgentResult<TeardownReport> {
        let mount = self.mount_point(id);
        if !mount.exists() {
            return Err(AgentError::VolumeNotFound(id.to_string()));
        }

        let mut report = TeardownReport::default();

        if let Err(e) = self.exec.run_checked(&Cmd::new("umount").arg(path_str(&mount))).await {
            warn!(%id, error = %e, "unmount failed, continuing teardown");
            report.record("umount", e);
        }

        if let Err(e) = fs::remove_dir_all(&mount) {
            warn!(%id, error = %e, "mount point removal failed, continuing teardown");
            report.record("remove mount point", AgentError::io(mount.display(), e));
        }

        let backing = self.backing_file(id);
        if backing.exists()
            && let Err(e) = fs::remove_file(&backing)
        {
            warn!(%id, error = %e, "backing file removal failed");
            report.record("remove backing file", AgentError::io(backing.display(), e));
        }

        info!(%id, clean = report.is_clean(), "volume removed");
        Ok(report)
    }

    /// List volumes: one per subdirectory of the storage root.
    pub fn list(&self) -> AgentResult<Vec<Volume>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let entries =
            fs::read_dir(&self.root).map_err(|e| AgentError::io(self.root.display(), e))?;

        let mut volumes = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| AgentError::io(self.root.display(), e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            let size_limit_gb = fs::metadata(self.backing_file(&id))
                .map(|m| m.len() / BYTES_PER_GIB)
                .unwrap_or(0);
            volumes.push(Volume {
                id,
                mount_point: entry.path(),
                size_limit_gb,
            });
        }
        volumes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(volumes)
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
