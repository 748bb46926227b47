use std::io::{self, Write};

use crate::pipeline::StreamingStatus;

/// Prints each generated fragment as soon as it arrives.
pub fn console_streamer(subword: &str) -> StreamingStatus {
    write_fragment(&mut io::stdout().lock(), subword)
}

/// Write and flush one fragment. Never asks the pipeline to stop, even if
/// the writer fails.
pub fn write_fragment<W: Write>(out: &mut W, subword: &str) -> StreamingStatus {
    if let Err(e) = out.write_all(subword.as_bytes()).and_then(|_| out.flush()) {
        tracing::debug!(error = %e, "failed to write streamed fragment");
    }
    StreamingStatus::Running
}
