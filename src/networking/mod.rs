pub mod bootstrap;
pub mod certificate;
pub mod communication;
pub mod discovery;
pub mod file_transfer;
pub mod interface;
pub mod remote;

// Re-export key components for easier access
pub use certificate::CertificateStore;
pub use discovery::{DiscoveryEngine, ResolvedService};
pub use file_transfer::{Transfer, TransferDirection, TransferStatus};
pub use interface::{InterfaceType, NetworkInterface};
pub use remote::{Remote, RemoteInfo, RemoteStatus};
