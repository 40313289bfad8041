//! portfwd command-line client and daemon
//!
//! The binary drives a [`portfwd_core::ForwardManager`] either in the
//! foreground or inside a background daemon reached over [`ipc`].

pub mod daemon;
pub mod foreground;
pub mod ipc;
pub mod output;
pub mod paths;
pub mod profiles;
pub mod protocol;
