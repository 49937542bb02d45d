//! Simple re-export of logging-related macros.
pub use color_eyre::eyre::eyre;
pub use tracing::{debug, error, info, span, trace, warn};

/// Install color_eyre as the global error handler. Frames from the async
/// runtime and the HTTP stack are hidden from reports.
#[tracing::instrument]
pub fn install_color_eyre() -> color_eyre::eyre::Result<()> {
    color_eyre::config::HookBuilder::default()
        .issue_url(concat!(env!("CARGO_PKG_REPOSITORY"), "/issues/new"))
        .add_issue_metadata("version", env!("CARGO_PKG_VERSION"))
        .add_default_filters()
        .add_frame_filter(Box::new(|frames| {
            let filters = &[
                "tokio::",
                "tracing::",
                "color_eyre::",
                "reqwest::",
                "hyper::",
                "<core::",
            ];

            frames.retain(|frame| match frame.name.as_ref() {
                Some(name) => !filters.iter().any(|f| name.starts_with(f)),
                None => true,
            });
        }))
        .install()?;

    Ok(())
}
