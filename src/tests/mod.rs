// Main test module that wires up the protocol, stream and listener suites
mod common;

// Initialize the logger before any test runs but allow it to be safely called multiple times
#[ctor::ctor]
fn init() {
    let _ = crate::logger::initialize_logger("test", Some(true));
}
