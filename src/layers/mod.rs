// SPDX-License-Identifier: MPL-2.0

#[path = "0-bio/mod.rs"]
pub mod bio;
#[path = "3-blob/mod.rs"]
pub mod blob;
#[path = "1-crypto/mod.rs"]
pub mod crypto;
#[path = "4-fs/mod.rs"]
pub mod fsblob;
#[path = "2-integrity/mod.rs"]
pub mod integrity;
