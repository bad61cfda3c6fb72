pub extern crate test_context;

pub mod global;
pub mod vmbuild_config;
