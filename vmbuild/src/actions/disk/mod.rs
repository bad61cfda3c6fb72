//! Disk image assembly.
//!
//! A disk is built in two calls. [`DiskBuilder::build_disk`] allocates the
//! image, exposes it as a block device, partitions, formats and mounts it,
//! and returns the mount point. The caller fills the mount point, then
//! [`DiskBuilder::finish_disk`] tears the chain down in reverse and publishes
//! the image under its final name.
//!
//! Non-raw images are exported through nbd and partitioned as a whole
//! device. Raw images are partitioned in place and their partitions exposed
//! through kpartx.

use std::{
    collections::{HashMap, HashSet},
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use vmbuild_config::{disk::format::DiskFormat, nbd::NbdConfig};

use self::{
    mount::MountHandle,
    nbd::{DeviceHandle, DeviceKind, DeviceProbe, NbdManager, Sleeper},
    partition::{PartitionMapper, ROOT_PARTITION},
};
use crate::{
    actions::populate::Populate,
    cancel::CancelToken,
    command::{ensure_tools, CommandRunner, Tool},
    error::BuildError,
    request::BuildRequest,
};

pub mod bootloader;
pub mod lock;
pub mod mount;
pub mod nbd;
pub mod partition;


/// Progress of one disk build. Stages only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiskStage {
    Created,
    ImageAllocated,
    /// non-raw only
    DeviceAttached,
    Partitioned,
    /// raw only
    DeviceMapped,
    Formatted,
    Mounted,
    Populated,
    Unmounted,
    DeviceDetached,
    Finalized,
}

impl fmt::Display for DiskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiskStage::Created => "created",
            DiskStage::ImageAllocated => "image allocated",
            DiskStage::DeviceAttached => "device attached",
            DiskStage::Partitioned => "partitioned",
            DiskStage::DeviceMapped => "device mapped",
            DiskStage::Formatted => "formatted",
            DiskStage::Mounted => "mounted",
            DiskStage::Populated => "populated",
            DiskStage::Unmounted => "unmounted",
            DiskStage::DeviceDetached => "device detached",
            DiskStage::Finalized => "finalized",
        };
        f.write_str(s)
    }
}

/// The image file being built and the name it is published under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArtifact {
    pub tmp_path: PathBuf,
    pub final_path: PathBuf,
    pub format: DiskFormat,
}

impl ImageArtifact {
    pub fn new(request: &BuildRequest, format: DiskFormat) -> Self {
        let final_path = request
            .output_dir
            .join(format!("{}.{}", request.target_name, format.extension()));
        let mut tmp = final_path.clone().into_os_string();
        tmp.push(".tmp");
        Self {
            tmp_path: PathBuf::from(tmp),
            final_path,
            format,
        }
    }

    /// Rename the tmp image to its final name.
    pub fn publish(&self) -> Result<PathBuf, BuildError> {
        self.publish_with(|from, to| fs::rename(from, to))
    }

    /// [`publish`](Self::publish) with a custom rename. On failure the tmp
    /// image stays where it is and nothing exists at the final path.
    pub fn publish_with<F>(&self, rename: F) -> Result<PathBuf, BuildError>
    where
        F: FnOnce(&Path, &Path) -> io::Result<()>,
    {
        rename(&self.tmp_path, &self.final_path).map_err(|e| BuildError::FinalizeFailed {
            tmp: self.tmp_path.clone(),
            out: self.final_path.clone(),
            reason: e.to_string(),
        })?;
        log::info!("Disk image written to {}", self.final_path.display());
        Ok(self.final_path.clone())
    }
}

/// Tmp image paths of the builds in flight
type ReservedArtifacts = Arc<Mutex<HashSet<PathBuf>>>;

/// Exclusive use of one tmp image path within a [`DiskBuilder`], taken
/// before any tool runs and released on drop.
#[derive(Debug)]
struct ArtifactReservation {
    reserved: ReservedArtifacts,
    tmp_path: PathBuf,
}

impl ArtifactReservation {
    fn acquire(reserved: &ReservedArtifacts, tmp_path: &Path) -> Result<Self, BuildError> {
        let mut paths = reserved.lock().unwrap_or_else(|e| e.into_inner());
        if !paths.insert(tmp_path.to_path_buf()) {
            return Err(BuildError::Config(format!(
                "{} is already being built",
                tmp_path.display()
            )));
        }
        Ok(Self {
            reserved: reserved.clone(),
            tmp_path: tmp_path.to_path_buf(),
        })
    }
}

impl Drop for ArtifactReservation {
    fn drop(&mut self) {
        self.reserved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.tmp_path);
    }
}

/// Resources held by one disk build.
///
/// Fields drop in declaration order, so even without an explicit teardown
/// the mount goes before the mapping and the mapping before the device.
/// The artifact reservation goes last.
#[derive(Debug)]
pub struct DiskSession {
    mount: Option<MountHandle>,
    mapper: Option<PartitionMapper>,
    device: Option<DeviceHandle>,
    root_partition: Option<PathBuf>,
    artifact: ImageArtifact,
    stage: DiskStage,
    _reservation: ArtifactReservation,
}

impl DiskSession {
    fn new(artifact: ImageArtifact, reservation: ArtifactReservation) -> Self {
        Self {
            mount: None,
            mapper: None,
            device: None,
            root_partition: None,
            artifact,
            stage: DiskStage::Created,
            _reservation: reservation,
        }
    }

    pub fn stage(&self) -> DiskStage {
        self.stage
    }

    pub fn artifact(&self) -> &ImageArtifact {
        &self.artifact
    }

    pub fn mount_point(&self) -> Option<&Path> {
        self.mount.as_ref().map(|m| m.mount_point())
    }

    pub fn root_partition(&self) -> Option<&Path> {
        self.root_partition.as_deref()
    }

    /// The device or file holding the partition table
    pub fn whole_disk(&self) -> (&Path, DeviceKind) {
        match self.device.as_ref() {
            Some(device) => (device.path(), device.kind()),
            None => (&self.artifact.tmp_path, DeviceKind::RawFile),
        }
    }

    fn advance(&mut self, stage: DiskStage) {
        debug_assert!(stage > self.stage, "{} -> {}", self.stage, stage);
        log::debug!(
            "{}: {} -> {}",
            self.artifact.tmp_path.display(),
            self.stage,
            stage
        );
        self.stage = stage;
    }

    /// Keep every resource in place when the session is dropped.
    fn keep_all(&mut self) {
        if let Some(mount) = self.mount.as_mut() {
            mount.keep_mounted();
        }
        if let Some(mapper) = self.mapper.as_mut() {
            mapper.keep_mapped();
        }
        if let Some(device) = self.device.as_mut() {
            device.keep_attached();
        }
    }

    /// Release everything acquired so far, newest first, and return the
    /// errors met on the way. A resource that cannot be released pins the
    /// ones below it.
    fn unwind(&mut self) -> Vec<BuildError> {
        let mut errors = Vec::new();

        if let Some(mount) = self.mount.as_mut() {
            if mount.mounted() {
                if let Err(e) = mount.unmount() {
                    errors.push(e);
                    self.keep_all();
                    return errors;
                }
            }
        }
        if let Some(mapper) = self.mapper.as_mut() {
            if mapper.mapped() {
                if let Err(e) = mapper.unmap() {
                    errors.push(e);
                    self.keep_all();
                    return errors;
                }
            }
        }
        if let Some(device) = self.device.as_mut() {
            if device.attached() {
                if let Err(e) = device.detach() {
                    errors.push(e);
                    self.keep_all();
                }
            }
        }
        if errors.is_empty() {
            log::info!(
                "Released resources of {}, image left at {}",
                self.stage,
                self.artifact.tmp_path.display()
            );
        }
        errors
    }

    /// Unmount, release the device and publish the image.
    fn finish_with<F>(&mut self, rename: F) -> Result<PathBuf, BuildError>
    where
        F: FnOnce(&Path, &Path) -> io::Result<()>,
    {
        if let Some(mount) = self.mount.as_mut() {
            if let Err(e) = mount.unmount() {
                self.keep_all();
                let (disk, kind) = self.whole_disk();
                return Err(BuildError::FinalizeFailed {
                    tmp: self.artifact.tmp_path.clone(),
                    out: self.artifact.final_path.clone(),
                    reason: format!("{}; {} {} left attached", e, kind, disk.display()),
                });
            }
        }
        self.advance(DiskStage::Unmounted);

        if let Some(mapper) = self.mapper.as_mut() {
            if let Err(e) = mapper.unmap() {
                mapper.keep_mapped();
                return Err(e);
            }
        }
        if let Some(device) = self.device.as_mut() {
            if let Err(e) = device.detach() {
                device.keep_attached();
                return Err(e);
            }
        }
        self.advance(DiskStage::DeviceDetached);

        let out = self.artifact.publish_with(rename)?;
        self.advance(DiskStage::Finalized);
        Ok(out)
    }
}

/// Drives disk builds and keeps their sessions until they are finished.
pub struct DiskBuilder {
    runner: Arc<dyn CommandRunner>,
    nbd: NbdManager,
    mapper_dir: PathBuf,
    cancel: CancelToken,
    sessions: Mutex<HashMap<PathBuf, DiskSession>>,
    reserved: ReservedArtifacts,
}

impl DiskBuilder {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn DeviceProbe>,
        sleeper: Arc<dyn Sleeper>,
        config: NbdConfig,
        cancel: CancelToken,
    ) -> Self {
        let mapper_dir = config.mapper_dir.clone();
        Self {
            nbd: NbdManager::new(runner.clone(), probe, sleeper, config),
            runner,
            mapper_dir,
            cancel,
            sessions: Mutex::new(HashMap::new()),
            reserved: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn nbd(&self) -> &NbdManager {
        &self.nbd
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<PathBuf, DiskSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stage of the build mounted at `mount_point`, if any
    pub fn session_stage(&self, mount_point: &Path) -> Option<DiskStage> {
        self.sessions().get(mount_point).map(|s| s.stage())
    }

    pub fn required_tools(format: DiskFormat) -> Vec<Tool> {
        let mut tools = vec![Tool::QemuImg, Tool::Sfdisk, Tool::Mkfs, Tool::Mount, Tool::Umount];
        if format.needs_nbd() {
            tools.extend([Tool::Modprobe, Tool::Lsmod, Tool::QemuNbd]);
        } else {
            tools.push(Tool::Kpartx);
        }
        tools
    }

    /// Allocate, partition, format and mount a new disk image.
    ///
    /// Returns the mount point to populate. On failure every resource
    /// acquired so far is released; the tmp image is left in place.
    pub fn build_disk(&self, build_path: &Path, request: &BuildRequest) -> Result<PathBuf, BuildError> {
        let format = request.disk_format()?;
        if !build_path.is_dir() {
            return Err(BuildError::Config(format!(
                "build path '{}' is not a directory",
                build_path.display()
            )));
        }
        let artifact = ImageArtifact::new(request, format);
        // held by the session from here on, so every exit path releases it
        let reservation = ArtifactReservation::acquire(&self.reserved, &artifact.tmp_path)?;

        ensure_tools(self.runner.as_ref(), &Self::required_tools(format))?;
        log::info!(
            "Building {} disk {} from {}",
            format,
            artifact.final_path.display(),
            build_path.display()
        );

        if format.needs_nbd() {
            self.cancel.check("loading the nbd module")?;
            self.nbd.ensure_module_loaded()?;
        }

        self.cancel.check("image allocation")?;
        partition::create_image(
            self.runner.as_ref(),
            &artifact.tmp_path,
            format,
            &request.disk_size,
        )?;
        let mut session = DiskSession::new(artifact, reservation);
        session.advance(DiskStage::ImageAllocated);

        if let Err(e) = self.bring_up(&mut session, request, format) {
            log::error!(
                "Disk build failed at stage '{}': {}",
                session.stage(),
                e
            );
            let cleanup = session.unwind();
            return Err(e.with_cleanup(cleanup));
        }

        let mount_point = session
            .mount_point()
            .map(Path::to_path_buf)
            .ok_or_else(|| BuildError::NotActive {
                resource: "mount".to_string(),
            })?;
        self.sessions().insert(mount_point.clone(), session);
        Ok(mount_point)
    }

    fn bring_up(
        &self,
        session: &mut DiskSession,
        request: &BuildRequest,
        format: DiskFormat,
    ) -> Result<(), BuildError> {
        let runner = self.runner.as_ref();
        let tmp = session.artifact.tmp_path.clone();

        let root_partition = if format.needs_nbd() {
            self.cancel.check("device attach")?;
            let device = session.device.insert(self.nbd.attach_image(&tmp)?);
            session.stage = DiskStage::DeviceAttached;

            self.cancel.check("partitioning")?;
            partition::partition_disk(runner, device.path())?;
            let part = self.nbd.wait_for_partition(device, ROOT_PARTITION)?;
            session.advance(DiskStage::Partitioned);
            part
        } else {
            self.cancel.check("partitioning")?;
            partition::partition_disk(runner, &tmp)?;
            session.advance(DiskStage::Partitioned);

            self.cancel.check("partition mapping")?;
            let mapper = session.mapper.insert(PartitionMapper::map(
                self.runner.clone(),
                &tmp,
                &self.mapper_dir,
            )?);
            let part = mapper.partition_path(ROOT_PARTITION)?.to_path_buf();
            session.advance(DiskStage::DeviceMapped);
            part
        };
        session.root_partition = Some(root_partition.clone());

        self.cancel.check("formatting")?;
        partition::format_partition(runner, &root_partition, request.fs_type)?;
        session.advance(DiskStage::Formatted);

        self.cancel.check("mounting")?;
        session.mount = Some(MountHandle::mount(self.runner.clone(), &root_partition)?);
        session.advance(DiskStage::Mounted);
        Ok(())
    }

    /// Record that the caller finished writing into `mount_point`.
    pub fn mark_populated(&self, mount_point: &Path) -> Result<(), BuildError> {
        let mut sessions = self.sessions();
        let session = sessions
            .get_mut(mount_point)
            .ok_or_else(|| not_active(mount_point))?;
        if session.stage() < DiskStage::Populated {
            session.advance(DiskStage::Populated);
        }
        Ok(())
    }

    /// Install extlinux on the mounted disk and, when the request names one,
    /// write the MBR to the whole disk.
    pub fn install_bootloader(&self, mount_point: &Path, request: &BuildRequest) -> Result<(), BuildError> {
        let disk = self
            .sessions()
            .get(mount_point)
            .map(|session| session.whole_disk().0.to_path_buf())
            .ok_or_else(|| not_active(mount_point))?;

        let mut tools = vec![Tool::Extlinux];
        if request.mbr.is_some() {
            tools.push(Tool::Dd);
        }
        ensure_tools(self.runner.as_ref(), &tools)?;

        self.cancel.check("bootloader installation")?;
        bootloader::install_extlinux(self.runner.as_ref(), mount_point, &request.target_name)?;
        if let Some(mbr) = request.mbr.as_ref() {
            bootloader::write_mbr(self.runner.as_ref(), mbr, &disk)?;
        }
        Ok(())
    }

    /// Unmount, release the device and publish the image built at
    /// `mount_point`. Returns the final image path.
    pub fn finish_disk(&self, mount_point: &Path, request: &BuildRequest) -> Result<PathBuf, BuildError> {
        self.finish_disk_with(mount_point, request, |from, to| fs::rename(from, to))
    }

    pub(crate) fn finish_disk_with<F>(
        &self,
        mount_point: &Path,
        request: &BuildRequest,
        rename: F,
    ) -> Result<PathBuf, BuildError>
    where
        F: FnOnce(&Path, &Path) -> io::Result<()>,
    {
        let mut sessions = self.sessions();
        let session = sessions
            .get(mount_point)
            .ok_or_else(|| not_active(mount_point))?;

        let expected = ImageArtifact::new(request, request.disk_format()?);
        if expected.final_path != session.artifact().final_path {
            return Err(BuildError::Config(format!(
                "{} holds {}, not {}",
                mount_point.display(),
                session.artifact().final_path.display(),
                expected.final_path.display()
            )));
        }

        let mut session = sessions
            .remove(mount_point)
            .ok_or_else(|| not_active(mount_point))?;
        drop(sessions);

        session.finish_with(rename)
    }

    /// Tear down the build at `mount_point` without publishing it.
    pub fn abort_disk(&self, mount_point: &Path) -> Result<(), BuildError> {
        let mut session = self
            .sessions()
            .remove(mount_point)
            .ok_or_else(|| not_active(mount_point))?;
        log::warn!(
            "Aborting disk build of {} at stage '{}'",
            session.artifact().final_path.display(),
            session.stage()
        );
        let mut errors = session.unwind().into_iter();
        match errors.next() {
            None => Ok(()),
            Some(first) => Err(first.with_cleanup(errors.collect())),
        }
    }

    /// Build, populate and finish a disk in one go, optionally installing a
    /// bootloader after populating.
    pub fn assemble(
        &self,
        build_path: &Path,
        request: &BuildRequest,
        populate: &dyn Populate,
        bootloader: bool,
    ) -> Result<PathBuf, BuildError> {
        let mount_point = self.build_disk(build_path, request)?;

        let filled = self
            .cancel
            .check("populate")
            .and_then(|_| populate.populate(&mount_point))
            .and_then(|_| self.mark_populated(&mount_point))
            .and_then(|_| {
                if bootloader {
                    self.install_bootloader(&mount_point, request)
                } else {
                    Ok(())
                }
            });

        if let Err(e) = filled {
            let cleanup = match self.abort_disk(&mount_point) {
                Ok(()) => Vec::new(),
                Err(BuildError::Cleanup { primary, mut cleanup }) => {
                    cleanup.insert(0, *primary);
                    cleanup
                }
                Err(other) => vec![other],
            };
            return Err(e.with_cleanup(cleanup));
        }

        self.finish_disk(&mount_point, request)
    }
}

fn not_active(mount_point: &Path) -> BuildError {
    BuildError::NotActive {
        resource: format!("disk build mounted at {}", mount_point.display()),
    }
}
