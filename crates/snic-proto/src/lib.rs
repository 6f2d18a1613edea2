//! Wire formats shared by the simple-NIC device backend and its host driver.
//!
//! Everything the driver and the device exchange is byte-exact and
//! little-endian: the BAR4 register window, packet descriptors, MSI-X vector
//! entries and the out-of-band bootstrap messages. All layouts are encoded
//! and decoded explicitly here; nothing relies on Rust struct layout.

pub mod bar0;
pub mod bar4;
pub mod msix;
pub mod oob;
pub mod ring;

pub use bar4::Bar4Write;
pub use msix::MsixEntry;
pub use ring::Descriptor;
