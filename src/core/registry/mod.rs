// src/core/registry/mod.rs

pub mod entry;
pub mod intake;
pub mod store;

pub use entry::{
    AddressFamily, DiscoveredInstance, Identity, PrinterStatus, RemotePrinter, ServiceKind,
    SlaveLink,
};
pub use store::Registry;
