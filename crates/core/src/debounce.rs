//! Continuous-observation window for unrecognised faces.
//!
//! A stranger must stay in front of the camera for a wall-clock hold period
//! before the session asks for their name. Frame rate is uncontrolled, so the
//! window is measured in time, never in frames. The caller supplies `now`,
//! which keeps every transition here a pure function.

use std::time::{Duration, Instant};

use crate::embedding::Embedding;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Debounce {
    #[default]
    NoObservation,
    Observing {
        /// First sighting of the current subject; later frames compare against it.
        embedding: Embedding,
        since: Instant,
    },
}

/// Result of feeding one unmatched sighting into the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// A new subject (or the first one); the window restarted at `now`.
    Started,
    /// Same subject, hold period not yet reached.
    Holding(Duration),
    /// Same subject held continuously for at least the hold period.
    Held(Duration),
}

impl Debounce {
    pub fn observe(
        &mut self,
        embedding: &Embedding,
        now: Instant,
        hold: Duration,
        same_face_threshold: f64,
    ) -> Observation {
        if let Debounce::Observing {
            embedding: subject,
            since,
        } = self
        {
            if subject.is_same_face(embedding, same_face_threshold) {
                let elapsed = now.saturating_duration_since(*since);
                return if elapsed >= hold {
                    Observation::Held(elapsed)
                } else {
                    Observation::Holding(elapsed)
                };
            }
        }

        *self = Debounce::Observing {
            embedding: embedding.clone(),
            since: now,
        };
        Observation::Started
    }

    pub fn reset(&mut self) {
        *self = Debounce::NoObservation;
    }

    pub fn subject(&self) -> Option<&Embedding> {
        match self {
            Debounce::NoObservation => None,
            Debounce::Observing { embedding, .. } => Some(embedding),
        }
    }
}
