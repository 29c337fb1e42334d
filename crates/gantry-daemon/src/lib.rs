//! Mock Carvera CNC controller daemon.
//!
//! Client software connects over TCP and talks to this server as if it
//! were the real machine: line commands answered from a static catalog
//! with hardware-faithful delays, instant single-token status queries,
//! an in-memory SD-card namespace, and in-band XMODEM-8K file transfer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   bytes   ┌─────────┐  commands  ┌────────────┐
//! │ TCP socket   │──────────▶│ framer  │───────────▶│ dispatcher │
//! └──────────────┘           └─────────┘            └─────┬──────┘
//!        ▲                                                │
//!        │ replies / transfer bytes                       │
//!        └──────────────┬─────────────────────────────────┘
//!                ┌──────┴───────┐
//!                │ catalog, vfs │  (gantry-core, shared by all
//!                │ clock, xmodem│   connections)
//!                └──────────────┘
//! ```
//!
//! The accept loop admits at most two concurrent connections; each runs
//! its own framer/dispatcher task on the cooperative scheduler. XMODEM
//! transfers run on a blocking worker thread with the owning connection
//! task pumping bytes between the socket and the engine, so the rest of
//! the server keeps serving while one connection is mid-transfer.

pub mod connection;
pub mod dispatch;
pub mod framer;
pub mod server;
pub mod transfer;

/// Embedded command catalog, loaded into memory once at startup.
pub const COMMAND_CATALOG_JSON: &str = include_str!("../artifacts/commands.json");

/// Embedded virtual-filesystem seed.
pub const VIRTUAL_FILES_JSON: &str = include_str!("../artifacts/virtual_files.json");
