// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! CLI entry point for the phase harness.

use anyhow::Result;
use phase_harness::cli::entrypoint;

fn main() -> Result<()> {
    entrypoint()
}
