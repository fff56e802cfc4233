mod read_env;
mod system;

#[cfg(any(test, feature = "test-support"))]
mod in_memory;

pub use read_env::ReadEnv;
pub use system::SystemEnv;

#[cfg(any(test, feature = "test-support"))]
pub use in_memory::InMemoryEnv;
