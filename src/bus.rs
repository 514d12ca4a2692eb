//! Typed in-process event bus.
//!
//! Every component publishes [`Event`]s to a shared [`EventBus`] and consumes
//! the topics it cares about through a [`Subscription`]. The bus is a thin
//! wrapper over a `tokio::sync::broadcast` channel: cloning the bus is cheap,
//! and dropping a subscription ends it.
//!
//! ```text
//! Link ──phot_sample/photometer_info──▶ Bus ──▶ Statistics Engine
//! Statistics Engine ──stats_info──────▶ Bus ──▶ Coordinator, GUI, DB
//! Coordinator ──calib_*/update_zp─────▶ Bus ──▶ Link (test), CLI
//! ```

use crate::core::{
    CalibrationSummary, DeviceInfo, Reading, Role, RoundStatistics, StatsProgress, WriteOutcome,
};
use crate::error::{AppResult, ZptessError};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

/// Default broadcast buffer.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Event discriminant used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Topic {
    PhotometerInfo,
    PhotometerOff,
    PhotSample,
    StatsProgress,
    StatsInfo,
    CalibBegin,
    CalibRoundInfo,
    CalibSummaryInfo,
    CalibEnd,
    UpdateZeroPoint,
    ZeroPointWritten,
}

/// Everything that travels over the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum Event {
    /// A link obtained device metadata.
    PhotometerInfo {
        /// Link role
        role: Role,
        /// Device metadata
        info: DeviceInfo,
    },
    /// A link could not reach its device or get its info.
    PhotometerOff {
        /// Link role
        role: Role,
        /// Human readable cause
        reason: String,
    },
    /// A deduplicated reading.
    PhotSample {
        /// Link role
        role: Role,
        /// The reading
        reading: Reading,
    },
    /// Statistics window still filling up.
    StatsProgress(StatsProgress),
    /// A reduced window.
    StatsInfo(RoundStatistics),
    /// The coordinator started a session.
    CalibBegin {
        /// Session token
        session: String,
    },
    /// A paired, valid round.
    CalibRoundInfo {
        /// Role of `stats`
        role: Role,
        /// 1-based round index
        round: u32,
        /// Statistics tagged with round data
        stats: RoundStatistics,
    },
    /// Final per-role result.
    CalibSummaryInfo(CalibrationSummary),
    /// The coordinator finished.
    CalibEnd {
        /// Session token
        session: String,
    },
    /// Request to store a new zero point.
    UpdateZeroPoint {
        /// Target link
        role: Role,
        /// Zero point to write
        zero_point: f64,
    },
    /// Outcome of an [`Event::UpdateZeroPoint`].
    ZeroPointWritten {
        /// Link role
        role: Role,
        /// Verification result
        outcome: WriteOutcome,
    },
}

impl Event {
    /// Topic of this event.
    pub fn topic(&self) -> Topic {
        match self {
            Event::PhotometerInfo { .. } => Topic::PhotometerInfo,
            Event::PhotometerOff { .. } => Topic::PhotometerOff,
            Event::PhotSample { .. } => Topic::PhotSample,
            Event::StatsProgress(_) => Topic::StatsProgress,
            Event::StatsInfo(_) => Topic::StatsInfo,
            Event::CalibBegin { .. } => Topic::CalibBegin,
            Event::CalibRoundInfo { .. } => Topic::CalibRoundInfo,
            Event::CalibSummaryInfo(_) => Topic::CalibSummaryInfo,
            Event::CalibEnd { .. } => Topic::CalibEnd,
            Event::UpdateZeroPoint { .. } => Topic::UpdateZeroPoint,
            Event::ZeroPointWritten { .. } => Topic::ZeroPointWritten,
        }
    }

    /// Role the event refers to, if any.
    pub fn role(&self) -> Option<Role> {
        match self {
            Event::PhotometerInfo { role, .. }
            | Event::PhotometerOff { role, .. }
            | Event::PhotSample { role, .. }
            | Event::CalibRoundInfo { role, .. }
            | Event::UpdateZeroPoint { role, .. }
            | Event::ZeroPointWritten { role, .. } => Some(*role),
            Event::StatsProgress(progress) => Some(progress.role),
            Event::StatsInfo(stats) => Some(stats.role),
            Event::CalibSummaryInfo(summary) => Some(summary.role),
            Event::CalibBegin { .. } | Event::CalibEnd { .. } => None,
        }
    }
}

/// Cloneable publish handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Bus with [`DEFAULT_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Bus with a custom broadcast buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event. Returns how many subscribers saw it; zero is fine.
    pub fn publish(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribes to the given topics. An empty slice means every topic.
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            topics: topics.to_vec(),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Filtered view of the bus. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    topics: Vec<Topic>,
}

impl Subscription {
    fn wants(&self, event: &Event) -> bool {
        self.topics.is_empty() || self.topics.contains(&event.topic())
    }

    /// Next event on a subscribed topic.
    ///
    /// Returns [`ZptessError::BusClosed`] once every publisher is gone. A
    /// subscriber that falls behind loses the oldest events and keeps going.
    pub async fn recv(&mut self) -> AppResult<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.wants(&event) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, topics = ?self.topics, "Event bus subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(ZptessError::BusClosed),
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv). `None` when nothing is pending.
    pub fn try_recv(&mut self) -> AppResult<Option<Event>> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.wants(&event) => return Ok(Some(event)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, topics = ?self.topics, "Event bus subscriber lagged");
                }
                Err(broadcast::error::TryRecvError::Closed) => return Err(ZptessError::BusClosed),
            }
        }
    }
}
