//! Ephemeral presence ("who is here, where is their caret").
//!
//! Awareness is not part of the document: entries are last-write-wins per
//! replica by a sender-side clock, never persisted, and dropped on peer
//! departure, explicit clear, local disconnect or idle timeout.
//!
//! Payloads are opaque bytes; [`Presence`] is a typed convenience payload
//! for renderers that want names, colors and carets.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use quire_core::{NodeKey, ReplicaId};

use crate::protocol::ProtocolError;

// ───────────────────────────────────────────────────────────────────
// Typed presence payload
// ───────────────────────────────────────────────────────────────────

/// RGBA color for caret/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable color derived from a replica id.
    pub fn from_replica(id: ReplicaId) -> Self {
        let hash = id.as_uuid().as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Caret inside a text node, as a visible character offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caret {
    pub node: NodeKey,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub name: String,
    pub color: CursorColor,
    pub cursor: Option<Caret>,
}

impl Presence {
    pub fn new(replica: ReplicaId, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: CursorColor::from_replica(replica),
            cursor: None,
        }
    }

    pub fn with_cursor(mut self, node: NodeKey, offset: usize) -> Self {
        self.cursor = Some(Caret { node, offset });
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (presence, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(presence)
    }
}

// ───────────────────────────────────────────────────────────────────
// Awareness channel
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct AwarenessEntry {
    clock: u64,
    /// `None` after the peer cleared its state; the clock is kept so
    /// older updates arriving late stay ignored.
    payload: Option<Vec<u8>>,
    last_seen: Instant,
}

/// Local awareness state plus the latest state of every remote peer.
#[derive(Debug, Clone)]
pub struct AwarenessChannel {
    local_id: ReplicaId,
    local: Option<Vec<u8>>,
    local_clock: u64,
    /// When the local state last got a new clock.
    local_stamped: Option<Instant>,
    remote: HashMap<ReplicaId, AwarenessEntry>,
    idle_timeout: Duration,
}

impl AwarenessChannel {
    pub fn new(local_id: ReplicaId, idle_timeout: Duration) -> Self {
        Self {
            local_id,
            local: None,
            local_clock: 0,
            local_stamped: None,
            remote: HashMap::new(),
            idle_timeout,
        }
    }

    /// Replace the local state. Returns the clock to broadcast it with.
    pub fn set_local(&mut self, payload: Vec<u8>) -> u64 {
        self.local = Some(payload);
        self.local_clock += 1;
        self.local_stamped = Some(Instant::now());
        self.local_clock
    }

    /// Clear the local state. Returns the clock to broadcast the clear with.
    pub fn clear_local(&mut self) -> u64 {
        self.local = None;
        self.local_clock += 1;
        self.local_stamped = Some(Instant::now());
        self.local_clock
    }

    /// Give an unchanged local state a fresh clock once a third of the
    /// idle timeout has passed since its last one, so peers keep it alive.
    /// Returns the clock to broadcast it with.
    pub fn renew_local(&mut self, now: Instant) -> Option<u64> {
        self.local.as_ref()?;
        let period = self.idle_timeout / 3;
        if let Some(at) = self.local_stamped {
            if now.saturating_duration_since(at) < period {
                return None;
            }
        }
        self.local_clock += 1;
        self.local_stamped = Some(now);
        Some(self.local_clock)
    }

    pub fn local(&self) -> Option<&[u8]> {
        self.local.as_deref()
    }

    pub fn local_clock(&self) -> u64 {
        self.local_clock
    }

    /// Apply a remote update. Returns true if the visible state changed.
    pub fn apply_remote(
        &mut self,
        replica: ReplicaId,
        clock: u64,
        payload: Option<Vec<u8>>,
        now: Instant,
    ) -> bool {
        if replica == self.local_id {
            return false;
        }
        if let Some(entry) = self.remote.get(&replica) {
            if clock <= entry.clock {
                log::trace!("Ignoring stale awareness from {replica} ({clock} <= {})", entry.clock);
                return false;
            }
        }
        let changed = self.get(&replica) != payload.as_deref();
        self.remote.insert(
            replica,
            AwarenessEntry {
                clock,
                payload,
                last_seen: now,
            },
        );
        changed
    }

    /// Current payload of `replica`, local or remote.
    pub fn get(&self, replica: &ReplicaId) -> Option<&[u8]> {
        if *replica == self.local_id {
            return self.local();
        }
        self.remote.get(replica)?.payload.as_deref()
    }

    /// Forget a remote peer. Returns true if it had visible state.
    pub fn remove(&mut self, replica: &ReplicaId) -> bool {
        self.remote
            .remove(replica)
            .is_some_and(|entry| entry.payload.is_some())
    }

    /// Drop every remote entry.
    pub fn clear(&mut self) {
        self.remote.clear();
    }

    /// Drop local and remote state, keeping the local clock monotonic.
    pub fn reset(&mut self) {
        self.local = None;
        self.local_stamped = None;
        self.remote.clear();
    }

    /// Hide the state of peers not heard from within the idle timeout.
    /// Their clock stays, so an update older than the expiry that arrives
    /// late is still ignored. Returns the peers whose state was hidden.
    pub fn expire_idle(&mut self, now: Instant) -> Vec<ReplicaId> {
        let timeout = self.idle_timeout;
        let mut expired = Vec::new();
        for (id, entry) in &mut self.remote {
            if entry.payload.is_some() && now.saturating_duration_since(entry.last_seen) >= timeout {
                entry.payload = None;
                expired.push(*id);
            }
        }
        expired
    }

    /// Remote peers with visible state.
    pub fn peers(&self) -> impl Iterator<Item = (&ReplicaId, &[u8])> {
        self.remote
            .iter()
            .filter_map(|(id, entry)| entry.payload.as_deref().map(|p| (id, p)))
    }

    pub fn peer_count(&self) -> usize {
        self.peers().count()
    }
}
