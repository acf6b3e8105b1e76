//! Timer constants (§6: "must be configurable in tests").
//!
//! Spec.md §9 leaves the exact `line_broken_timeout` value an open
//! question ("choose a value and expose it as a constant"); the
//! resolution and rationale for every default below is recorded in
//! DESIGN.md. Configuration *loading* (files, env vars, CLI) is an
//! explicit Non-goal — this is a plain struct built by literal.

use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct SwitchConfig {
    /// Resets on every accepted inbound packet on a line; expiry closes
    /// the line as broken (§4.6).
    pub line_broken_timeout: Duration,
    /// How long an `opening`/`pathing` line waits for the remote open
    /// before the open is considered failed.
    pub line_open_timeout: Duration,
    /// Period of the periodic channel-GC sweep (§4.7).
    pub channel_gc_period: Duration,
    /// Period of the periodic stats log (§9.2 ambient observability).
    pub stats_log_period: Duration,
    /// Grace window `Close()` gives outstanding work before every line
    /// is force-closed as down (§5, §8 scenario S6).
    pub shutdown_grace: Duration,
    /// A path negotiation performed within this long of `last_sync` is
    /// downgraded to a cheap single-path recheck instead of a full
    /// negotiate (§4.9).
    pub path_recheck_freshness: Duration,
    /// Cadence of the periodic `PathRecheck` command that re-probes every
    /// line (§4.9 "a periodic command attempts a quick single-path
    /// recheck..."). Not named explicitly in spec.md §6's list of timer
    /// constants; resolved as an open question in DESIGN.md.
    pub path_recheck_period: Duration,
    /// How long an `opened` line may sit with no channels and no path
    /// sync before the periodic GC sweep closes it as idle (§4.6
    /// "any | idle policy | closed | close-idle"). Not named explicitly
    /// in spec.md §6's list of timer constants; resolved as an open
    /// question in DESIGN.md.
    pub line_idle_timeout: Duration,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            line_broken_timeout: Duration::from_secs(60),
            line_open_timeout: Duration::from_secs(15),
            channel_gc_period: Duration::from_secs(2),
            stats_log_period: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
            path_recheck_freshness: Duration::from_secs(120),
            path_recheck_period: Duration::from_secs(30),
            line_idle_timeout: Duration::from_secs(600),
        }
    }
}
