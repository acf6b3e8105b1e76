//! `Stats()` surface (§6, expanded by SPEC_FULL §11 from the original
//! implementation's `controller_net.go` counters).

/// Plain in-process counters; not a metrics pipeline (that's out of
/// scope per §1).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    pub running_lines: u64,
    pub open_lines: u64,
    pub channels: u64,
    pub num_send_packets: u64,
    pub num_send_packet_errors: u64,
    pub num_received_packets: u64,
    pub num_received_packet_errors: u64,
}
