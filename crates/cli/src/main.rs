//! The main entrypoint for gsid, which just performs global initialization
//! and then calls out into the library.

use anyhow::Result;

async fn run() -> Result<()> {
    gsid_utils::initialize_tracing();
    tracing::trace!("starting gsid");
    gsid_lib::cli::run_from_iter(std::env::args()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
