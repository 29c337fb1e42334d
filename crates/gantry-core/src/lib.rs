//! Core machine model for the Gantry mock CNC controller.
//!
//! This crate holds everything about the emulated machine that does not
//! touch a socket: the declarative command catalog, the in-memory virtual
//! filesystem, the XMODEM-8K transfer engine, and the settable machine
//! clock. The `gantry-daemon` crate wires these into a TCP server.
//!
//! # Layering
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ gantry-daemon   (framing, dispatch, TCP) │
//! ├──────────────────────────────────────────┤
//! │ gantry-core                              │
//! │   catalog   command token -> descriptor  │
//! │   vfs       path -> entry, one mutex     │
//! │   xmodem    blocking transfer engine     │
//! │   clock     epoch anchor for `time`      │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Nothing in this crate performs async I/O. The XMODEM engine is blocking
//! by contract (the real controller stalls its console during transfers)
//! and talks to the outside world through the [`xmodem::TransferPort`]
//! trait, which the daemon implements over a channel bridge.

pub mod catalog;
pub mod clock;
pub mod vfs;
pub mod xmodem;
