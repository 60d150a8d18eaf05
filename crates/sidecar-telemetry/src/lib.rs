//! Logging setup. Everything goes to stderr so stdout stays free for command output.

use parking_lot::Mutex;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Layer, Registry};

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Base level. `RUST_LOG`, when set, replaces the whole filter at startup.
    pub log_level: Level,
    /// Per-module levels, e.g. `("sidecar_engine", DEBUG)`.
    pub module_levels: Vec<(String, Level)>,
    /// One JSON object per line instead of the human format.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::from_level_name("info", false)
    }
}

impl TelemetryConfig {
    /// Unknown level names mean `INFO`.
    pub fn from_level_name(level: &str, json: bool) -> Self {
        Self {
            log_level: level.parse().unwrap_or(Level::INFO),
            module_levels: Vec::new(),
            json,
        }
    }

    /// The filter in `EnvFilter` directive syntax.
    pub fn directives(&self) -> String {
        directives(self.log_level, &self.module_levels)
    }
}

fn directives(base: Level, modules: &[(String, Level)]) -> String {
    std::iter::once(base.as_str().to_ascii_lowercase())
        .chain(
            modules
                .iter()
                .map(|(module, level)| format!("{module}={}", level.as_str().to_ascii_lowercase())),
        )
        .collect::<Vec<_>>()
        .join(",")
}

/// Keeps the live filter adjustable after startup.
pub struct TelemetryGuard {
    base: Level,
    modules: Mutex<Vec<(String, Level)>>,
    handle: Option<reload::Handle<EnvFilter, Registry>>,
}

impl TelemetryGuard {
    /// Raise or lower one module's level on the running subscriber.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let mut modules = self.modules.lock();
        match modules.iter_mut().find(|(m, _)| m == module) {
            Some(entry) => entry.1 = level,
            None => modules.push((module.to_string(), level)),
        }
        let Some(handle) = &self.handle else { return };
        let spec = directives(self.base, &modules);
        if let Err(e) = handle.reload(EnvFilter::new(&spec)) {
            tracing::warn!(error = %e, filter = %spec, "log filter reload failed");
        }
    }

    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.modules.lock().clone()
    }

    /// False when some other global subscriber got there first.
    pub fn installed(&self) -> bool {
        self.handle.is_some()
    }
}

/// Install the global subscriber. Only the first call in a process takes effect.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directives()));
    let (filter, handle) = reload::Layer::new(filter);

    let output = if config.json {
        fmt::layer()
            .json()
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let installed = tracing_subscriber::registry().with(filter).with(output).try_init().is_ok();

    TelemetryGuard {
        base: config.log_level,
        modules: Mutex::new(config.module_levels),
        handle: installed.then_some(handle),
    }
}
