// slotd library: everything the binaries share

pub mod daemon;

// Polling assertions and process fixtures for unit and integration tests
#[doc(hidden)]
pub mod test_utils;
