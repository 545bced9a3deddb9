pub mod agent;
pub mod bus;
pub mod config;
pub mod error;
pub mod memory;
pub mod provider;
pub mod scheduler;
pub mod telegram;
pub mod tools;
pub mod workspace;

pub use agent::Agent;
pub use bus::MessageBus;
pub use config::Config;
pub use memory::MemoryStore;
pub use scheduler::JobScheduler;
pub use tools::ToolRegistry;
pub use workspace::Workspace;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
