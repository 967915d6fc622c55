pub mod distributed;
pub mod dtype;
pub mod model;
pub mod moe;
pub mod train;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
