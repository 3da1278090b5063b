// Device daemon: control socket, application supervisor and self-update
// Shared between the slotd, slotd-launcher and slotctl binaries

pub mod advertise;
pub mod archive;
pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod crash;
pub mod package_tool;
pub mod persistence;
pub mod process;
pub mod protocol;
pub mod server;
pub mod slots;
pub mod supervisor;
pub mod updater;

// Control-socket client used by slotctl
pub mod client;
