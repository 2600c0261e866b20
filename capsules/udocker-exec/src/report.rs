//! Plain-text rendering of an invocation result for the function host.

use crate::context::InvocationContext;
use crate::orchestrator::Envelope;
use envelope::OperationResult;

const RULE_WIDTH: usize = 75;

/// Header naming the host's log coordinates, followed by a horizontal rule.
pub fn header(ctx: &InvocationContext) -> String {
    format!(
        "SCAR: Log group name: {}\nSCAR: Log stream name: {}\n{}\n",
        ctx.log_group_name,
        ctx.log_stream_name,
        "-".repeat(RULE_WIDTH)
    )
}

/// Render the outbound text: the header, then either the captured container output or
/// an error block with the failure message and its causes.
pub fn render_plain_text(envelope: &Envelope, ctx: &InvocationContext) -> String {
    let mut text = header(ctx);
    match &envelope.result {
        OperationResult::Success { data, .. } => text.push_str(&data.output),
        OperationResult::Error { error, .. } => {
            text.push_str("ERROR: Exception launched:\n ");
            text.push_str(&error.message);
            text.push('\n');
            let causes = error
                .details
                .as_ref()
                .and_then(|details| details.get("causes"))
                .and_then(|causes| causes.as_array());
            for cause in causes.into_iter().flatten() {
                if let Some(line) = cause.as_str() {
                    text.push_str(line);
                    text.push('\n');
                }
            }
        }
    }
    text
}
