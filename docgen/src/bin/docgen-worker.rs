//! Worker executable: reads one request on stdin, writes one reply on stdout.
//!
//! Logs go to stderr so they never interleave with the reply line.

use docgen::RecordSheetRenderer;
use docgen::logging::{LoggingOptions, init_logging};
use docgen::worker::serve_stdio;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let mut options = LoggingOptions::from_env();
    // File output belongs to the parent process.
    options.log_dir = None;
    options.filter.get_or_insert_with(|| "docgen=warn".to_string());
    let _guard = init_logging(&options)?;

    serve_stdio(&RecordSheetRenderer::default()).await?;
    Ok(())
}
