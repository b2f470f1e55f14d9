//! Hook runtime and lifecycle orchestration binding the six binaries in
//! `src/bin/` to `infinite-context-core`.

pub mod orchestration;
pub mod runtime;
