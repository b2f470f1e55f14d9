use infinite_context_hooks::orchestration::subagent_stop;
use infinite_context_hooks::runtime::{init_logging, run_hook};

#[tokio::main]
async fn main() {
    init_logging();
    let storage = match infinite_context_core::store::Storage::open_default() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("[infinite-context] failed to open storage: {e}");
            return;
        }
    };

    run_hook(|input| async move {
        match input {
            Some(input) => subagent_stop(&storage, input).await,
            None => infinite_context_hooks::runtime::HookOutput::None,
        }
    })
    .await;
}
