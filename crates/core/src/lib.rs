pub mod admission;
pub mod backend;
pub mod lora;
pub mod native;
pub mod request;
pub mod slots;
pub mod worker;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
