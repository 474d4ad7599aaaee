// SPDX-License-Identifier: MPL-2.0

pub(crate) use crate::{
    error::{Errno::*, Error},
    layers::bio::BlockId,
    return_errno, return_errno_with_msg,
};

pub(crate) type Result<T> = core::result::Result<T, Error>;

#[allow(unused_imports)]
pub(crate) use std::sync::Arc;

#[allow(unused_imports)]
pub(crate) use log::{debug, error, info, warn};
