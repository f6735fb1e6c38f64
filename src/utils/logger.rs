use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `RUST_LOG` wins; otherwise our own crate at info (debug when verbose).
fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)))
}

fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "ctfify=debug,info"
    } else {
        "ctfify=info"
    }
}

/// Compact human logs on stderr. stdout stays free for command output
/// (raw requests, extracted values) so it can be piped.
///
/// Solver scripts may call this more than once; later calls are no-ops.
pub fn init_cli_logger(verbose: bool) {
    let _ = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init();
}

/// JSON 格式日誌，一行一個事件，方便把攻擊過程存檔再用 jq 查
///
/// Fields sit at the top level next to `timestamp`, `level` and `target`,
/// e.g. `jq 'select(.target | startswith("ctfify::adapters::server"))'`.
pub fn init_json_logger(verbose: bool) {
    let _ = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_span_list(false)
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .try_init();
}
