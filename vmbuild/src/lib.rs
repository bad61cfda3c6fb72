use context::build_exec_context;

pub mod actions;
pub mod cancel;
pub mod command;
pub mod console;
pub mod context;
pub mod error;
pub mod request;
pub mod utils;

extern crate anyhow;

pub fn vmbuild_main() {
    let exec_ctx = match build_exec_context() {
        Ok(ctx) => ctx,
        Err(e) => {
            log::error!("Failed to build execution context: {:?}", e);
            std::process::exit(1);
        }
    };
    log::debug!("Execution context: {:?}", exec_ctx);

    if let Err(e) = exec_ctx.cancel_token().install_signal_handler() {
        log::warn!("Failed to install Ctrl-C handler: {}", e);
    }

    if let Err(e) = actions::run(&exec_ctx) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}
