//! Checkout worker
//!
//! Binary entry point, see the library crate for the wiring.

#[tokio::main]
async fn main() {
    if let Err(e) = checkout_worker::run().await {
        eprintln!("Fatal error: {:?}", e);
        std::process::exit(1);
    }
}
