use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_LOG_FILTER: &str = "murmur=info,murmur_llm=info,murmur_storage=info";

/// Installs the global subscriber. `RUST_LOG` wins over the default filter.
/// Logs go to stderr so they never interleave with streamed replies on stdout.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if let Err(error) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
    {
        eprintln!("tracing already initialised: {error}");
    }
}
