//! Logging setup for embedders and tests.

use color_eyre::Result;
use tracing_error::ErrorLayer;
use tracing_subscriber::{Layer as _, fmt::MakeWriter, layer::SubscriberExt as _};

/// Build a subscriber writing to the provided writer.
///
/// Verbosity is controlled by the `FORGE_LOG` environment variable using the
/// usual env-filter syntax. The error layer captures span traces so reports
/// rendered by `color_eyre` carry their logging context.
pub fn make_logger<W>(writer: W) -> Result<impl tracing::Subscriber>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let logger = tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(true)
                .with_thread_names(true)
                .with_writer(writer)
                .with_filter(
                    tracing_subscriber::EnvFilter::builder()
                        .with_env_var("FORGE_LOG")
                        .from_env_lossy(),
                ),
        );
    Ok(logger)
}
