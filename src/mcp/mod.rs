pub mod capability;
pub mod instance;
pub mod manager;
pub mod router;
pub mod transport;

pub use capability::CapabilityIndex;
pub use manager::ServerManager;
pub use router::Router;
