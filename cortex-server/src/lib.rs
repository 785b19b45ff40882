//! # cortex-server — Robot-side streaming service
//!
//! Captures one or more camera devices, composites them into a single
//! frame, encodes it to H.264 and streams it over UDP to whichever
//! client currently holds the drive turn. Waiting clients are told
//! their queue time. The active client's control input drives the
//! robot through plugins (see [`drive`]).
//!
//! ## Layout
//!
//! - [`config`]: TOML configuration
//! - [`capture`]: frame sources and the compositor
//! - [`encoder`]: external-process H.264 encoder
//! - [`plugin`]: plugin trait and channel routing
//! - [`drive`] / [`serial`]: the `KIWI` drive plugin and its serial link
//! - [`service`]: receive task and tick loop

pub mod capture;
pub mod config;
pub mod drive;
pub mod encoder;
pub mod plugin;
pub mod serial;
pub mod service;
