use std::{fs, path::Path};

use crate::{
    actions::boot::BootFiles,
    command::{run_checked, CommandRunner, Tool, ToolCommand},
    error::BuildError,
};

/// Root device as seen by the booted guest
const GUEST_ROOT_DEVICE: &str = "/dev/sda1";

/// Install SYSLINUX into `<root>/boot` and write an `extlinux.conf` that
/// boots the kernel and initrd found there.
pub fn install_extlinux(
    runner: &dyn CommandRunner,
    root: &Path,
    label: &str,
) -> Result<(), BuildError> {
    let boot_dir = root.join("boot");
    let files = BootFiles::scan(&boot_dir)?;

    let mut cmd = ToolCommand::new(Tool::Extlinux);
    cmd.arg("--install").arg(&boot_dir);
    run_checked(runner, &cmd, |reason| BuildError::ToolFailed {
        tool: Tool::Extlinux.to_string(),
        reason,
    })?;

    let conf = extlinux_config(label, &files);
    let conf_path = boot_dir.join("extlinux.conf");
    fs::write(&conf_path, conf)
        .map_err(|e| BuildError::io(format!("Failed to write {}", conf_path.display()), e))?;
    log::info!("Installed extlinux in {}", boot_dir.display());
    Ok(())
}

fn extlinux_config(label: &str, files: &BootFiles) -> String {
    format!(
        "DEFAULT {label}\nLABEL {label}\nSAY booting {label}\nLINUX /boot/{}\nAPPEND root={}\nINITRD /boot/{}\n",
        files.kernel_name(),
        GUEST_ROOT_DEVICE,
        files.initrd_name(),
    )
}

/// Copy the boot code of `mbr` into the first 440 bytes of `disk`, keeping
/// the partition table.
pub fn write_mbr(runner: &dyn CommandRunner, mbr: &Path, disk: &Path) -> Result<(), BuildError> {
    if !mbr.is_file() {
        return Err(BuildError::ArtifactNotFound {
            what: format!(
                "master boot record {}",
                mbr.file_name().unwrap_or_default().to_string_lossy()
            ),
            dir: mbr.parent().unwrap_or(Path::new("/")).to_path_buf(),
        });
    }

    let mut cmd = ToolCommand::new(Tool::Dd);
    cmd.arg(format!("if={}", mbr.display()))
        .arg("conv=notrunc")
        .arg("bs=440")
        .arg("count=1")
        .arg(format!("of={}", disk.display()));
    run_checked(runner, &cmd, |reason| BuildError::ToolFailed {
        tool: Tool::Dd.to_string(),
        reason,
    })?;
    log::info!("Wrote MBR {} to {}", mbr.display(), disk.display());
    Ok(())
}
