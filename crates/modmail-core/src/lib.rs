//! Core domain + application logic for the mod-mail relay bot.
//!
//! This crate is framework-agnostic. The chat platform and the ignore-list
//! storage live behind ports (traits); the Telegram adapter lives in
//! `modmail-telegram`.

pub mod audit;
pub mod commands;
pub mod config;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod ignore;
pub mod logging;
pub mod messaging;
pub mod ports;
pub mod relay;
pub mod spam;

pub use errors::{Error, Result};
