//! printcore: a local control daemon between a browser UI and G-code printers.
//!
//! The core is three actors joined by bounded queues: the [`switchboard`],
//! the [`controller`] (discovery and dispatch) and one [`job`] runner per
//! active print. [`daemon::Daemon`] wires them together; [`web`] is the thin
//! HTTP / websocket adapter in front of it.

pub mod browser;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod device;
pub mod gcode;
pub mod job;
pub mod message;
pub mod registry;
pub mod switchboard;
pub mod web;

pub use daemon::{ClientQueues, Daemon};
pub use message::{Kind, Message};
