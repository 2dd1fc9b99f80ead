//! # XMR Bridge Core
//!
//! Threshold signing core for the Monero bridge, built on FROST over Ed25519.
//!
//! This crate provides the fundamental building blocks for:
//! - Distributed Key Generation (DKG) with Feldman verification
//! - Two-round FROST signing sessions with share verification
//! - The deposit/withdrawal request state machine that decides when to sign
//!
//! ## Protocol Overview
//!
//! N participants jointly hold an Ed25519 key; any T of them can sign without
//! reconstructing it. Aggregated signatures are ordinary Ed25519 signatures
//! under the group public key.
//!
//! ## Example
//!
//! ```rust,ignore
//! use xmr_bridge_core::{keygen, sign, KeyShare};
//!
//! // Run distributed key generation
//! let key_share = keygen::run_dkg(&params, &slot, &transport, timeout).await?;
//!
//! // Coordinate a signing session
//! let (session_id, signature) = coordinator.sign("deposit-1", 0, &digest).await?;
//! ```

pub mod bridge;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keygen;
pub mod keystore;
pub mod ledger;
pub mod mpc;
pub mod registry;
pub mod request;
pub mod sign;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use types::{KeyShare, ParticipantId, PublicKey, SessionId, Signature};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default threshold for a 3-participant setup
pub const DEFAULT_THRESHOLD: usize = 2;

/// Default number of participants
pub const DEFAULT_PARTICIPANTS: usize = 3;
