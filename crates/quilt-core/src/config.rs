// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Stack configuration.

use core::time::Duration;

/// Tunables for a quilt stack.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether creating an atomic patch group is permitted at all.
    pub atomic_patchgroups_allowed: bool,
    /// How often the host should invoke the journal's timer callback.
    pub transaction_period: Duration,
    /// Bytes reserved per journal transaction slot.
    pub transaction_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            atomic_patchgroups_allowed: true,
            transaction_period: Duration::from_secs(15),
            transaction_size: 64 * 4096,
        }
    }
}
