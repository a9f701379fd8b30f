use anyhow::anyhow;
use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber. Filtering follows `RUST_LOG` (default
/// `info`) unless `verbose` forces `debug`. Fails if called twice.
pub fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    INITIALISED
        .set(())
        .map_err(|_| anyhow!("tracing is already initialised"))?;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);
    Registry::default().with(filter).with(fmt_layer).try_init()?;
    Ok(())
}
