//! End-to-end integration tests for Coffer.
//!
//! These tests drive the vault facade across module boundaries:
//! - Envelope encryption and key rotation
//! - Versioning, rollback and environment inheritance
//! - Token and policy authorization
//! - OTP generation, drift and HOTP resynchronisation
//! - Audit completeness and immutability

#![cfg(test)]
