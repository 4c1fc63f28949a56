//! CLI command implementations.
//!
//! Each submodule implements a specific CLI command:
//! - [`otp`] - TOTP/HOTP generation and verification
//! - [`token`] - Access token generation
//! - [`export`] - Snapshot format conversion
//! - [`demo`] - In-memory vault walkthrough

pub mod demo;
pub mod export;
pub mod otp;
pub mod token;

pub use demo::DemoCommand;
pub use export::ExportCommand;
pub use otp::OtpCommand;
pub use token::TokenCommand;
