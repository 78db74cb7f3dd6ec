// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test discovery and ordering.

mod test_list;

pub use test_list::{TestCase, TestId, TestList};
