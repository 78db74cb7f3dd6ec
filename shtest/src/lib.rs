// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The shtest CLI: a thin shim over [`shtest_runner`] that parses the
//! command line and the environment into runner options.

pub mod dispatch;
