//! tracing subscriber setup for the binaries and for hosts without their own.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::console::ConsoleLayer;

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
pub fn init() -> bool {
    init_with("info")
}

/// Returns `false` if a global subscriber was already installed; that one is kept.
pub fn init_with(default_directive: &str) -> bool {
    install(default_directive, None)
}

/// Like [`init_with`], with host console streaming layered on top.
pub fn init_with_console(default_directive: &str, console: ConsoleLayer) -> bool {
    install(default_directive, Some(console))
}

fn install(default_directive: &str, console: Option<ConsoleLayer>) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    // stdout은 백엔드 readiness 라인 전용
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(console)
        .try_init()
        .is_ok()
}
