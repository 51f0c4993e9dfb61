#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod cloudinit;
pub mod config;
pub mod console;
pub mod credentials;
pub mod error;
pub mod hypervisor;
pub mod image;
pub mod iso9660;
pub mod logging;
pub mod manager;
pub mod monitor;
pub mod mux;
pub mod overlay;
pub mod paths;
pub mod qmp;
pub mod readiness;
pub mod registry;
pub mod retry;
pub mod ssh;
pub mod util;
pub mod vm_state;
