//! Logging configuration using tracing.

use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

/// Dependencies that are chatty at `info`/`debug`
const QUIET_TARGETS: &[&str] = &["aws_config", "aws_smithy_runtime", "hyper_util", "reqwest"];

/// Handle to the installed filter, used to apply the configured level once
/// the configuration file has been read.
pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    from_env: bool,
}

impl LogHandle {
    /// Switch to `level`. Does nothing when `RUST_LOG` chose the filter.
    pub fn set_level(&self, level: &str) -> anyhow::Result<()> {
        if self.from_env {
            return Ok(());
        }
        self.handle.reload(EnvFilter::try_new(directives(level))?)?;
        Ok(())
    }
}

/// Initialize logging with the specified level.
///
/// `RUST_LOG` takes precedence over `level` when it is set.
pub fn init(level: &str) -> anyhow::Result<LogHandle> {
    let (filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (
            EnvFilter::try_new(directives(level)).unwrap_or_else(|_| EnvFilter::new("info")),
            false,
        ),
    };
    let (layer, handle) = reloadable(filter, from_env);

    tracing_subscriber::registry()
        .with(layer)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()?;

    Ok(handle)
}

fn reloadable(filter: EnvFilter, from_env: bool) -> (reload::Layer<EnvFilter, Registry>, LogHandle) {
    let (layer, handle) = reload::Layer::new(filter);
    (layer, LogHandle { handle, from_env })
}

fn directives(level: &str) -> String {
    QUIET_TARGETS
        .iter()
        .fold(level.to_string(), |acc, target| format!("{},{}=warn", acc, target))
}
