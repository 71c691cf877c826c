use tracing_subscriber::EnvFilter;

use crate::redaction::RedactingWriter;

/// Install the global subscriber. `RUST_LOG` overrides the default `info`
/// level; all output goes through the redacting writer.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(RedactingWriter::stderr());

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("logging already initialised: {e}");
    }
}
