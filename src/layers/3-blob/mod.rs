// SPDX-License-Identifier: MPL-2.0

//! The layer of blobs: variable-length byte sequences assembled from
//! fixed-size blocks.
//!
//! A blob is stored as a balanced fixed-fanout tree of nodes, one node
//! per block. Inner nodes hold child block ids, leaves hold payload
//! bytes. The tree is *left-max-data*: along every root-to-leaf path
//! except the rightmost one, every inner node is full and every leaf is
//! full. That shape makes leaf lookup pure arithmetic and lets the leaf
//! count be computed from the rightmost path alone.
//!
//! The root block id identifies the blob and never changes, not even
//! when the tree grows or shrinks in depth; depth changes overwrite the
//! root block's bytes in place.

mod blob_store;
mod node;
mod node_store;
mod tree;

pub use self::{
    blob_store::{Blob, BlobStoreOnBlocks},
    node::{InnerNode, LeafNode, Node, NodeLayout, NODE_HEADER_NBYTES},
    node_store::NodeStore,
    tree::{DataTree, LeafHandle},
};
