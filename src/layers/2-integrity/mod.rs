// SPDX-License-Identifier: MPL-2.0

//! The layer of block freshness and completeness tracking.
//!
//! Authenticated encryption (the layer below) proves a block was written
//! by a key holder, but not that it is the *latest* block: an attacker
//! controlling the storage can roll blocks back, re-introduce deleted
//! blocks, swap blocks between ids, or delete blocks outright. This
//! layer defends against all four by tagging every written block with a
//! writer id and a monotonic version counter, and checking both against
//! a locally persisted table on every load.

mod integrity_block_store;
mod known_block_versions;

pub use self::{
    integrity_block_store::{IntegrityBlockStore, IntegrityConfig},
    known_block_versions::KnownBlockVersions,
};
