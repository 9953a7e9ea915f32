//! Tilesmith.
//!
//! Tilesmith is a standalone web service that serves computed tiles and tile metadata. Identical
//! concurrent requests are coalesced into one computation, computations are throttled per
//! pipeline, tiles of batched types are grouped into timed batches, and every result is cached.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod endpoints;
mod ingest;
mod logging;
mod server;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
