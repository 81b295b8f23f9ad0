//! Convoy CLI - operator tooling for coordinated repository loops
//!
//! Binary name: `convoy`

use std::process;

use convoy::cli::{handlers::run_cli, setup::init_tracing};

#[tokio::main]
async fn main() {
    if let Err(e) = init_tracing() {
        #[allow(clippy::print_stderr)]
        {
            eprintln!("Warning: {e}");
        }
    }

    if let Err(err) = run_cli().await {
        #[allow(clippy::print_stderr)]
        {
            eprintln!("Error: {err:#}");
        }

        let code = err
            .downcast_ref::<convoy_core::Error>()
            .map_or(1, convoy_core::Error::exit_code);

        #[allow(clippy::exit)]
        process::exit(code);
    }
}
