//! # cortex-client
//!
//! Operator side of the Cortex link.
//!
//! - **App**: `ClientApp`, the fixed-rate loop tying network, video,
//!   keyboard and console together
//! - **Config**: `ClientConfig` loaded from TOML
//! - **Console**: the 40x30 status grid drawn with ratatui
//! - **Input**: drive keys per keyboard layout, mouse, text prompt
//! - **Player**: hands the H.264 stream to an external player

pub mod app;
pub mod config;
pub mod console;
pub mod input;
pub mod player;
