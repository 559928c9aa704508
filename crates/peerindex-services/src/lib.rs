//! peerindex-services — the registry, the content store, and the transfer
//! coordinator that ties the two together behind the control dispatcher.

pub mod dispatch;
pub mod registry;
pub mod store;
pub mod transfer;

pub use dispatch::Dispatcher;
pub use registry::{ContentRecord, ContentState, Located, PeerEntry, Registry, RegistryStats};
pub use store::{BlobKey, ContentStore, FsContentStore, MemoryContentStore};
pub use transfer::{ContentKey, TransferCoordinator, TransferSettings};
