//! Workspace root package; carries the `cargo-husky` git hooks dev-dependency.
