// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::sync::Once;

static INIT: Once = Once::new();

/// Performs global initialization for tests: installs the test tracing
/// subscriber. Keeps `CCDEMUX_LOG` available to turn up verbosity.
pub fn init() {
    INIT.call_once(base::tracing_setup::install_for_tests);
}
