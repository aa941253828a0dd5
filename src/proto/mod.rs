//! Wire protocol: the ASCII control-line protocol and channel capability
//! bits (§6), the file-list wire format the restore engine emits (§6
//! "File-list wire format"), and the image-backup wire header (§6 "Image
//! backup header on the wire").
//!
//! These are pure encode/decode boundaries with no networking of their
//! own — TLS/identity plumbing and the actual socket loop are named
//! external collaborators out of scope (base spec §1).

pub mod control;
pub mod filelist;
pub mod image;

pub use control::{CapabilityBits, ControlMessage, ProtoError};
pub use filelist::WireEntry;
