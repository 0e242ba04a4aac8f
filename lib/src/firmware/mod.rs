//! Firmware update engine: Intel-HEX ingestion, the PIC32 bootloader frame
//! protocol, the multi-state update orchestrator, version ordering, and the
//! released-firmware metadata client.

pub mod bootloader;
pub mod hex;
pub mod releases;
pub mod updater;
pub mod version;

pub use hex::{HexParser, HexRecord};
pub use releases::{ReleaseChannel, ReleaseClient, ReleaseClientOptions, ReleaseInfo};
pub use updater::{FirmwareUpdater, UpdateOptions, UpdateState};
pub use version::{FirmwareVersion, compare_version_strings};
