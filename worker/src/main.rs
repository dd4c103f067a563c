use driver::mem::MemoryDriver;

use worker::app;

/// The worker is spawned by the mux with fd 3 (data) and fd 4 (control)
/// already connected, credentials and config locations in the
/// environment. The in-memory driver is the built-in backend; a native
/// database binding plugs in behind the same facade.
fn main() {
    let driver = MemoryDriver::new();
    let code = app::run(driver);
    std::process::exit(code);
}
