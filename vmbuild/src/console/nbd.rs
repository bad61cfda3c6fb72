use std::path::PathBuf;

use clap::Subcommand;

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
pub enum NbdCommand {
    /// Disconnect a device left attached by an interrupted build
    Detach {
        /// Device node, e.g. /dev/nbd0
        device: PathBuf,
    },
}
