//! Snapshot support for the simulation.
//!
//! Provides binary serialization via `bitcode` with a versioned header.
//! Listeners are closures and are never serialized: a snapshot can only be
//! restored into a simulation built with the same event labels.

use serde::{Deserialize, Serialize};

use crate::fixed::Time;
use crate::id::{PersonId, StateId};
use crate::population::PopulationStore;
use crate::rng::SimRng;
use crate::schedule::ScheduledEntry;
use crate::sim::{SimConfig, SimState, Simulation};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying a simulation snapshot.
pub const SNAPSHOT_MAGIC: u32 = 0xE915_0001;

/// Current format version. Increment when breaking the wire format.
pub const FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("bitcode encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("invalid magic number: expected 0x{:08X}, got 0x{:08X}", SNAPSHOT_MAGIC, .0)]
    InvalidMagic(u32),
    #[error("unsupported format version: expected {}, got {}", FORMAT_VERSION, .0)]
    UnsupportedVersion(u32),
    #[error("snapshot from future version {0} (this build supports up to {FORMAT_VERSION})")]
    FutureVersion(u32),
    #[error("bitcode decoding failed: {0}")]
    Decode(String),
    #[error("snapshot events {snapshot:?} do not match simulation events {simulation:?}")]
    EventMismatch {
        snapshot: Vec<String>,
        simulation: Vec<String>,
    },
    #[error("snapshot content rejected: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Snapshot header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub magic: u32,
    pub version: u32,
    /// Simulation time when the snapshot was taken.
    pub time: Time,
}

impl SnapshotHeader {
    pub fn new(time: Time) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version: FORMAT_VERSION,
            time,
        }
    }

    pub fn validate(&self) -> Result<(), DeserializeError> {
        if self.magic != SNAPSHOT_MAGIC {
            return Err(DeserializeError::InvalidMagic(self.magic));
        }
        if self.version > FORMAT_VERSION {
            return Err(DeserializeError::FutureVersion(self.version));
        }
        if self.version < FORMAT_VERSION {
            return Err(DeserializeError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

/// Decode only the header of a snapshot.
pub fn read_snapshot_header(data: &[u8]) -> Result<SnapshotHeader, DeserializeError> {
    let snapshot: SimSnapshot =
        bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))?;
    Ok(snapshot.header)
}

// ---------------------------------------------------------------------------
// Serializable simulation state
// ---------------------------------------------------------------------------

/// The serializable portion of a simulation. Excludes listeners and the
/// derived indexes, which are rebuilt on restore.
#[derive(Debug, Serialize, Deserialize)]
struct SimSnapshot {
    header: SnapshotHeader,
    config: SimConfig,
    state: SimState,
    labels: Vec<String>,
    current: Vec<StateId>,
    pending: Vec<(PersonId, StateId)>,
    event_labels: Vec<String>,
    entries: Vec<ScheduledEntry>,
    rng: SimRng,
}

impl Simulation {
    /// Serialize the simulation state to bytes.
    pub fn snapshot(&self) -> Result<Vec<u8>, SerializeError> {
        let snapshot = SimSnapshot {
            header: SnapshotHeader::new(self.state.time),
            config: self.config.clone(),
            state: self.state,
            labels: self.population.state_labels().to_vec(),
            current: self.population.current_states().to_vec(),
            pending: self.updates.pending(),
            event_labels: self
                .scheduler
                .event_labels()
                .into_iter()
                .map(str::to_string)
                .collect(),
            entries: self.scheduler.all_entries().copied().collect(),
            rng: self.rng.clone(),
        };
        bitcode::serialize(&snapshot).map_err(|e| SerializeError::Encode(e.to_string()))
    }

    /// Replace this simulation's state with a snapshot. Listeners are kept.
    ///
    /// Nothing is modified unless the whole snapshot is accepted.
    pub fn restore(&mut self, data: &[u8]) -> Result<(), DeserializeError> {
        let snapshot: SimSnapshot =
            bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))?;
        snapshot.header.validate()?;

        let simulation: Vec<String> = self
            .scheduler
            .event_labels()
            .into_iter()
            .map(str::to_string)
            .collect();
        if snapshot.event_labels != simulation {
            return Err(DeserializeError::EventMismatch {
                snapshot: snapshot.event_labels,
                simulation,
            });
        }

        let invalid = |e: crate::error::SimError| DeserializeError::Invalid(e.to_string());
        let population = PopulationStore::restore(snapshot.labels, snapshot.current).map_err(invalid)?;

        let mut updates = self.updates.clone();
        updates.configure_for(&population);
        for (person, state) in &snapshot.pending {
            updates.queue(&[*person], *state).map_err(invalid)?;
        }

        if let Some(bad) = snapshot
            .entries
            .iter()
            .find(|e| !population.contains_person(e.person))
        {
            return Err(DeserializeError::Invalid(format!(
                "scheduled entry for unknown person {}",
                bad.person.0
            )));
        }
        if let Some(bad) = snapshot
            .entries
            .iter()
            .find(|e| !self.scheduler.contains_event(e.event))
        {
            return Err(DeserializeError::Invalid(format!(
                "scheduled entry for unknown event {}",
                bad.event.0
            )));
        }

        self.scheduler.clear_all();
        for entry in snapshot.entries {
            self.scheduler.restore_entry(entry).map_err(invalid)?;
        }
        self.population = population;
        self.updates = updates;
        self.config = snapshot.config;
        self.state = snapshot.state;
        self.rng = snapshot.rng;
        Ok(())
    }
}
