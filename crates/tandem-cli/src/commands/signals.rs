//! SIGINT/SIGTERM handling.

use anyhow::Result;

/// Runs `on_signal` on a background thread when SIGINT or SIGTERM arrives.
#[cfg(unix)]
pub fn on_shutdown(on_signal: impl Fn() + Send + 'static) -> Result<()> {
    use anyhow::Context;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use tracing::info;

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handlers")?;
    std::thread::Builder::new()
        .name("tandem-signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "shutdown requested");
                on_signal();
            }
        })
        .context("Failed to spawn signal thread")?;
    Ok(())
}

#[cfg(not(unix))]
pub fn on_shutdown(_on_signal: impl Fn() + Send + 'static) -> Result<()> {
    Ok(())
}
