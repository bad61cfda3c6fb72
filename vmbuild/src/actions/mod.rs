use std::sync::Arc;

use anyhow::Result;

use crate::{
    command::{tool_report, CommandRunner, SystemRunner},
    console::{nbd::NbdCommand, Action},
    context::VmBuildExecContext,
    utils::abs_path,
};

use disk::{
    nbd::{NbdManager, SysfsProbe, ThreadSleeper},
    DiskBuilder,
};
use populate::{ContainerArchive, CopyTree, Populate};

pub mod boot;
pub mod disk;
pub mod initrd;
pub mod iso;
pub mod populate;
pub mod postbuild;
pub mod rootfs;
pub mod staged;

pub fn run(ctx: &VmBuildExecContext) -> Result<()> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let cancel = ctx.cancel_token();

    match &ctx.command.action {
        Action::Disk(param) => {
            let request = ctx.disk_request(param)?;
            let nbd = ctx.manifest().nbd.clone();
            let builder = DiskBuilder::new(
                runner.clone(),
                Arc::new(SysfsProbe::from_config(&nbd)),
                Arc::new(ThreadSleeper),
                nbd,
                cancel.clone(),
            );
            let populate: Box<dyn Populate> = match &param.docker {
                Some(archive) => Box::new(ContainerArchive::new(runner.clone(), archive)),
                None => Box::new(CopyTree::new(runner.clone(), &request.source_path)),
            };
            let image = builder.assemble(
                &request.source_path,
                &request,
                populate.as_ref(),
                request.mbr.is_some(),
            )?;
            log::info!("Disk image ready: {}", image.display());
        }
        Action::Iso(param) => {
            let request = ctx.iso_request(param)?;
            iso::build_iso(runner.as_ref(), cancel, &request.source_path, &request)?;
        }
        Action::Rootfs(param) => {
            let request = ctx.target_request(param)?;
            rootfs::export_rootfs(runner.as_ref(), cancel, &request.source_path, &request)?;
        }
        Action::Initrd(param) => {
            let request = ctx.target_request(param)?;
            let targets =
                initrd::export_boot_targets(runner.as_ref(), cancel, &request.source_path, &request)?;
            log::info!(
                "Boot targets ready: {}, {}",
                targets.kernel.display(),
                targets.initrd.display()
            );
        }
        Action::Postbuild(param) => {
            postbuild::run_postbuild(
                runner.clone(),
                cancel,
                &abs_path(&param.build_path),
                &ctx.manifest().postbuild.scripts,
            )?;
        }
        Action::Check => {
            let mut missing = 0;
            for (tool, path) in tool_report(runner.as_ref()) {
                match path {
                    Some(path) => println!("{:<12} {}", tool.binary(), path.display()),
                    None => {
                        missing += 1;
                        println!("{:<12} MISSING", tool.binary());
                    }
                }
            }
            if missing > 0 {
                anyhow::bail!("{} required tool(s) missing", missing);
            }
        }
        Action::Nbd(NbdCommand::Detach { device }) => {
            let nbd = ctx.manifest().nbd.clone();
            let manager = NbdManager::new(
                runner.clone(),
                Arc::new(SysfsProbe::from_config(&nbd)),
                Arc::new(ThreadSleeper),
                nbd,
            );
            manager.detach_device(device)?;
        }
    }
    Ok(())
}
