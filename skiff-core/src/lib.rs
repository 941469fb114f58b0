//! Skiff LAN file-transfer engine.
//! Peers find each other over UDP broadcast, agree on a session with a
//! one-shot TCP handshake, talk over a single ordered control channel, and
//! move file bytes over parallel range connections.

pub mod control;
pub mod discovery;
pub mod frame;
pub mod model;
pub mod transfer;

pub use control::{ControlAction, ControlChannel, ControlError, ControlEvent, DirectoryProvider};
pub use discovery::{
    AcceptPolicy, Discovery, DiscoveryConfig, DiscoveryError, DiscoveryHandle, EstablishedSession,
    SessionDecision, DISCOVERY_PORT, HANDSHAKE_PORT,
};
pub use frame::{BufferPool, FrameError, BUFFER_SIZE};
pub use model::{DeviceAnnouncement, DirectoryListing, FileDigest, FileMeta, FolderMeta};
pub use transfer::{
    download, partition_ranges, ContentSource, Range, TransferConfig, TransferError,
    TransferServer, TransferSession,
};
