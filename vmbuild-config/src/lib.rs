#[deny(clippy::all)]
pub mod disk;
pub mod iso;
pub mod manifest;
pub mod nbd;
pub mod postbuild;
pub mod utils;

extern crate anyhow;
