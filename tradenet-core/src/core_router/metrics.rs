/*
    Metrics - broadcast and relay counters for the router

    Provides counters and gauges for:
    - Inbound envelopes (received, dropped by reason, relayed)
    - Outbound scheduling (scheduled, cancelled, sent)
    - Per-peer back-pressure (outbox overflow, failed sends)
    - Peer health (connected peers, disconnects by reason)
*/

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    describe_counter!(
        "tradenet_envelopes_received_total",
        "Inbound envelopes, labeled by message type"
    );
    describe_counter!(
        "tradenet_envelopes_dropped_total",
        "Inbound envelopes dropped before reaching a store, labeled by reason (seen, not_ready, malformed, unknown_version, unknown_type)"
    );
    describe_counter!(
        "tradenet_envelopes_relayed_total",
        "Envelope copies queued to peers as gossip relay"
    );
    describe_counter!(
        "tradenet_broadcasts_total",
        "Local broadcasts, labeled by stage (scheduled, cancelled, sent)"
    );
    describe_counter!(
        "tradenet_outbox_overflow_total",
        "Pending sends dropped because a peer outbox was full"
    );
    describe_counter!(
        "tradenet_send_failures_total",
        "Sends the transport reported as failed"
    );
    describe_counter!(
        "tradenet_peer_disconnects_total",
        "Peers disconnected, labeled by reason (decode_budget, remote)"
    );
    describe_gauge!("tradenet_connected_peers", "Peers with an open outbox");
    describe_gauge!(
        "tradenet_pending_broadcasts",
        "Local broadcasts waiting for their delay timer"
    );
}

pub fn envelope_received(message_type: &'static str) {
    counter!("tradenet_envelopes_received_total", "type" => message_type).increment(1);
}

pub fn envelope_dropped(reason: &'static str) {
    counter!("tradenet_envelopes_dropped_total", "reason" => reason).increment(1);
}

pub fn envelopes_relayed(copies: usize) {
    counter!("tradenet_envelopes_relayed_total").increment(copies as u64);
}

pub fn broadcast_stage(stage: &'static str) {
    counter!("tradenet_broadcasts_total", "stage" => stage).increment(1);
}

pub fn outbox_overflow() {
    counter!("tradenet_outbox_overflow_total").increment(1);
}

pub fn send_failed() {
    counter!("tradenet_send_failures_total").increment(1);
}

pub fn peer_disconnected(reason: &'static str) {
    counter!("tradenet_peer_disconnects_total", "reason" => reason).increment(1);
}

pub fn set_connected_peers(count: usize) {
    gauge!("tradenet_connected_peers").set(count as f64);
}

pub fn set_pending_broadcasts(count: usize) {
    gauge!("tradenet_pending_broadcasts").set(count as f64);
}
