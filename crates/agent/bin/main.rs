// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! `capsule-agent`: a reference agent entrypoint binary. Materialized environments that want to
//! run Rust callables through the bridge can point `runtime_bin` at this binary directly; it
//! connects back to the controller, executes the one call it receives against a small built-in
//! registry, and exits.

use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let registry = agent::demo_registry();

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("failed to start the agent's async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(agent::serve(&args, &registry)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("agent session failed: {e}");
            ExitCode::FAILURE
        }
    }
}
