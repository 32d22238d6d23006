//! Encrypted index builder for relational data.
//!
//! Given plaintext tables with declared primary- and foreign-key
//! relationships, the builder emits into an untrusted relational store a
//! family of encrypted tables and encrypted multi-maps that let the holder
//! of the master secret run selection, equi-join and semi/anti/outer-join
//! queries without revealing row contents, attribute values or row
//! identifiers.
//!
//! Three layouts are supported, dispatched as tagged variants:
//!
//! * [`Variant::Spx`]: per-table encrypted rows, a flat filter EMM and an
//!   uncorrelated-join EMM.
//! * [`Variant::Corr`]: the SPX tables plus a dependent-filter token set
//!   and a correlated-join EMM.
//! * [`Variant::Pkfk`]: per-table encrypted tables with embedded join and
//!   filter tokens, no separate EMMs.
//!
//! The build is offline, single-shot and idempotent under overwrite:
//! re-running with the same inputs and keys reproduces the token tables
//! exactly (cell ciphertexts are randomized AEAD and differ per run).

pub mod builder;
pub mod crypto;
pub mod datagen;
pub mod emm;
pub mod encoding;
pub mod error;
pub mod store;
pub mod tables;

pub use builder::{build, BuildReport, CancelToken, Variant};
pub use crypto::MasterKey;
pub use error::{BuildError, Result};
pub use store::{EncStore, IndexKind, PlainStore};
pub use tables::{CellContent, CellType, Database, Table, TableHeaders};
