pub mod handle;
pub mod host;
pub mod math;
pub mod proxy;
pub mod script_harness;
pub mod scripts;
pub mod world;
