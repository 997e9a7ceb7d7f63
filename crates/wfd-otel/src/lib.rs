use once_cell::sync::OnceCell;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Console subscriber on stderr honoring `RUST_LOG`, default `info`.
pub fn init() {
    init_with_verbose(false);
}

/// Like [`init`], but defaults to `debug` for the `wfd` targets when
/// `verbose` is set. An explicit `RUST_LOG` always wins.
pub fn init_with_verbose(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    install(filter, verbose);
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "info,wfd=debug"
    } else {
        "info"
    }
}

fn install(filter: EnvFilter, verbose: bool) {
    let console = fmt::layer().with_writer(std::io::stderr).with_filter(filter);
    let registry = tracing_subscriber::registry().with(console);
    let Some(dir) = std::env::var("WFD_LOG_DIR").ok().filter(|d| !d.trim().is_empty()) else {
        let _ = registry.try_init();
        return;
    };
    if std::fs::create_dir_all(&dir).is_err() {
        let _ = registry.try_init();
        tracing::warn!(directory = %dir, "failed to create log directory; file logging disabled");
        return;
    }
    let prefix = std::env::var("WFD_LOG_PREFIX").unwrap_or_else(|_| "wfd".into());
    let rotation = std::env::var("WFD_LOG_ROTATION").unwrap_or_else(|_| "daily".into());
    let (nb, guard) = tracing_appender::non_blocking(file_writer(&dir, &prefix, &rotation));
    let _ = FILE_GUARD.set(guard);
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(nb)
        .with_filter(Targets::new().with_target("wfd", level));
    let _ = registry.with(file_layer).try_init();
}

fn file_writer(dir: &str, prefix: &str, rotation: &str) -> RollingFileAppender {
    match rotation.to_lowercase().as_str() {
        "hourly" => tracing_appender::rolling::hourly(dir, prefix),
        "minutely" => tracing_appender::rolling::minutely(dir, prefix),
        "never" => tracing_appender::rolling::never(dir, prefix),
        _ => tracing_appender::rolling::daily(dir, prefix),
    }
}
