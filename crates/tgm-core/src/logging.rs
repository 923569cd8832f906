use crate::Result;

/// Initialize tracing for the tool.
///
/// Filter defaults to info for our crates and can be overridden with `RUST_LOG`.
/// A second call is a no-op.
pub fn init(service_name: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("info,tgm=info,tgm_core=info,{service_name}=info"))
    });

    // Already installed (tests, repeated init): keep the first subscriber.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();

    Ok(())
}
