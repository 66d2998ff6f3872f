/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! A thin wrapper around `fs2`'s advisory file locking. Lock acquisition
//! failure is treated as fatal: the resource manager does not retry.

use crate::resource::ResourceError;
use fs2::FileExt;
use std::fs::File;
use std::path::Path;

pub fn acquire_exclusive(file: &File, path: &Path) -> Result<(), ResourceError> {
    file.try_lock_exclusive()
        .map_err(|_| ResourceError::LockFailed(path.display().to_string()))
}

pub fn release(file: &File) -> Result<(), ResourceError> {
    FileExt::unlock(file).map_err(ResourceError::Io)
}
