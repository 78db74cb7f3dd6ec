// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;
use shtest::dispatch::ShtestApp;

fn main() {
    let app = ShtestApp::parse();
    std::process::exit(app.exec());
}
