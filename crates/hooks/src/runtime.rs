//! Hook runtime
//!
//! The five-point contract every hook binary follows: bounded stdin read,
//! body execution with errors caught and logged rather than propagated,
//! stdout write, always-exit-0, stdout drained before the process ends.
//! A hook serves exactly one request, not a long-lived connection.

use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncReadExt;

/// Stdin read timeout. Generous enough to survive a slow host writer.
const STDIN_READ_TIMEOUT: Duration = Duration::from_millis(800);

/// What a hook body writes to standard output.
pub enum HookOutput {
    /// Nothing to emit (e.g. `SessionEnd`, `SubagentStop`, or an empty
    /// restore/recall result).
    None,
    /// Plain text, e.g. `PreCompact`'s compaction summary.
    Text(String),
    /// `{"hookSpecificOutput": {"hookEventName": ..., "additionalContext": ...}}`.
    Json(Value),
}

/// Read and parse the hook's stdin input. Never fails: a timeout, I/O
/// error, or malformed/non-object JSON all resolve to `None`, which callers
/// treat as "no input".
pub async fn read_input() -> Option<Value> {
    let mut stdin = tokio::io::stdin();
    let mut buf = Vec::new();

    let read = tokio::time::timeout(STDIN_READ_TIMEOUT, stdin.read_to_end(&mut buf)).await;
    let Ok(Ok(_)) = read else {
        tracing::warn!("[infinite-context] stdin read timed out or failed, treating as no input");
        return None;
    };

    if buf.is_empty() {
        return None;
    }

    match serde_json::from_slice::<Value>(&buf) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) => {
            tracing::warn!("[infinite-context] stdin was valid JSON but not an object, ignoring");
            None
        }
        Err(e) => {
            tracing::warn!("[infinite-context] failed to parse stdin as JSON: {e}");
            None
        }
    }
}

/// Write `output` to stdout and flush, draining any buffered bytes before
/// returning. `HookOutput::None` writes nothing.
pub async fn write_output(output: HookOutput) {
    use tokio::io::AsyncWriteExt;

    let bytes: Option<String> = match output {
        HookOutput::None => None,
        HookOutput::Text(text) => Some(text),
        HookOutput::Json(value) => match serde_json::to_string(&value) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::error!("[infinite-context] failed to serialize hook output: {e}");
                None
            }
        },
    };

    let Some(bytes) = bytes else { return };

    let mut stdout = tokio::io::stdout();
    if let Err(e) = stdout.write_all(bytes.as_bytes()).await {
        tracing::error!("[infinite-context] failed to write stdout: {e}");
        return;
    }
    if let Err(e) = stdout.flush().await {
        tracing::error!("[infinite-context] failed to flush stdout: {e}");
    }
}

/// Run a hook body end to end: read input, execute `body`, write whatever
/// it returns. Any panic-free error from `body` must already be caught by
/// `body` itself and folded into `HookOutput::None` — this function always
/// returns, and every binary that calls it always exits 0.
pub async fn run_hook<F, Fut>(body: F)
where
    F: FnOnce(Option<Value>) -> Fut,
    Fut: std::future::Future<Output = HookOutput>,
{
    let input = read_input().await;
    let output = body(input).await;
    write_output(output).await;
}

/// Initialize the stderr-only tracing subscriber every hook binary uses.
/// Standard output is reserved for the hook's single JSON/text payload.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_output_none_emits_nothing() {
        write_output(HookOutput::None).await;
    }

    #[tokio::test]
    async fn write_output_json_serializes() {
        write_output(HookOutput::Json(serde_json::json!({"hookSpecificOutput": {}}))).await;
    }
}
