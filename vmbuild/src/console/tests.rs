use std::path::PathBuf;

use super::*;

#[test]
fn test_command_line_args_default() {
    let args = CommandLineArgs::parse_from(["vmbuild", "check"]);
    assert_eq!(args.action, Action::Check);
    assert_eq!(args.manifest_path, "vmbuild.toml");
    assert_eq!(args.workdir, ".");
    assert!(!args.action.needs_manifest());
}

#[test]
fn test_command_line_args_with_manifest() {
    // test short
    let args = CommandLineArgs::parse_from(["vmbuild", "-f", "custom.toml", "check"]);
    assert_eq!(args.manifest_path, "custom.toml");
    // test long, after the subcommand
    let args = CommandLineArgs::parse_from(["vmbuild", "check", "--manifest", "custom.toml"]);
    assert_eq!(args.manifest_path, "custom.toml");
}

#[test]
fn test_command_line_args_postbuild() {
    let args = CommandLineArgs::parse_from(["vmbuild", "postbuild", "debian.stage1"]);
    assert!(args.action.needs_manifest());
    let Action::Postbuild(param) = args.action else {
        panic!("Expected Action::Postbuild");
    };
    assert_eq!(param.build_path, PathBuf::from("debian.stage1"));
}

#[test]
fn test_command_line_args_disk() {
    let args = CommandLineArgs::parse_from(["vmbuild", "disk", "debian.stage1"]);
    match args.action {
        Action::Disk(param) => {
            assert_eq!(param.target.build_path, PathBuf::from("debian.stage1"));
            assert!(param.target.target.is_none());
            assert!(param.format.is_none());
            assert!(param.size.is_none());
            assert!(param.docker.is_none());
        }
        other => panic!("Expected Action::Disk, got {:?}", other),
    }
}

#[test]
fn test_command_line_args_disk_overrides() {
    let args = CommandLineArgs::parse_from([
        "vmbuild",
        "disk",
        "debian.stage1",
        "--format",
        "raw",
        "--size",
        "4G",
        "-O",
        "minimal",
        "--output-dir",
        "out",
        "--docker",
        "image.tar",
        "--mbr",
        "/usr/lib/syslinux/mbr/mbr.bin",
    ]);
    let Action::Disk(param) = args.action else {
        panic!("Expected Action::Disk");
    };
    assert_eq!(param.format.as_deref(), Some("raw"));
    assert_eq!(param.size.unwrap().bytes(), 4 * 1024 * 1024 * 1024);
    assert_eq!(param.target.target.as_deref(), Some("minimal"));
    assert_eq!(param.target.output_dir, Some(PathBuf::from("out")));
    assert_eq!(param.docker, Some(PathBuf::from("image.tar")));
    assert_eq!(
        param.mbr,
        Some(PathBuf::from("/usr/lib/syslinux/mbr/mbr.bin"))
    );
}

#[test]
fn test_command_line_args_invalid_size() {
    let r = CommandLineArgs::try_parse_from(["vmbuild", "disk", "x", "--size", "lots"]);
    assert!(r.is_err());
}

#[test]
fn test_command_line_args_iso() {
    let args =
        CommandLineArgs::parse_from(["vmbuild", "iso", "debian.stage1", "--isolinux", "misc/isolinux"]);
    let Action::Iso(param) = args.action else {
        panic!("Expected Action::Iso");
    };
    assert_eq!(param.isolinux, Some(PathBuf::from("misc/isolinux")));
}

#[test]
fn test_command_line_args_rootfs_and_initrd() {
    let args = CommandLineArgs::parse_from(["vmbuild", "rootfs", "debian.stage1", "-O", "x"]);
    assert!(args.action.needs_manifest());
    assert!(matches!(args.action, Action::Rootfs(TargetParam { .. })));
    let args = CommandLineArgs::parse_from(["vmbuild", "initrd", "debian.stage1"]);
    assert!(matches!(args.action, Action::Initrd(_)));
}

#[test]
fn test_command_line_args_nbd_detach() {
    let args = CommandLineArgs::parse_from(["vmbuild", "nbd", "detach", "/dev/nbd3"]);
    assert_eq!(
        args.action,
        Action::Nbd(NbdCommand::Detach {
            device: PathBuf::from("/dev/nbd3")
        })
    );
    assert!(!args.action.needs_manifest());
}
