//! Core of an asynchronous MongoDB wire protocol driver: wire framing (OP_MSG/OP_QUERY),
//! SCRAM authentication, a pooled connection layer, logical sessions and multi-statement
//! transactions, and a cursor engine for streaming `find`/`getMore` results.
//!
//! This crate deliberately stops short of a full CRUD/SDAM-aware driver (see `SPEC_FULL.md`
//! for the exact boundary); it exposes the primitives those would be built on:
//! [`Client`], [`ClientSession`], [`Cursor`], and the error taxonomy in [`error`].
#![warn(missing_docs, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
#![allow(clippy::derive_partial_eq_without_eq)]

mod client;
mod cmap;
mod cursor;
pub mod error;
mod namespace;
mod oid;
mod operation;
pub(crate) mod runtime;
mod wire;

pub use client::{
    Client, ClientOptions, ClientSession, Credential, ClusterTime, ServerAddress, TlsOptions,
};
pub use cursor::{Cursor, Map};
pub use error::{Error, Result};
pub use namespace::Namespace;
pub use oid::ObjectId;
pub use operation::find::FindOptions;
