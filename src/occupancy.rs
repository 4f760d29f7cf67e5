//! Push health derived from occupancy and control notifications.
use crate::codec::{Control, ControlType, Occupancy};

/// Transition requested by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccupancySignal {
    /// Publishers are back and streaming is active.
    Up,
    /// No publishers left, or streaming was paused.
    Down,
    /// The server disabled streaming for the session.
    Disabled,
    /// The server asked for a full reconnect.
    Reset,
}

/// Health last declared to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushHealth {
    /// Notifications are flowing.
    Up,
    /// Notifications are not flowing.
    Down,
}

/// Publisher count and freshness for one monitoring channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOccupancy {
    /// Timestamp of the latest occupancy update, in milliseconds.
    pub last_timestamp: i64,
    /// Publishers reported by that update.
    pub publishers: u32,
}

/// Declares the push subsystem up or down from two redundant monitoring channels.
///
/// Owned by the connection control loop, so it needs no locking. Every method returns the signal
/// to publish, if any; a signal is only returned when the declared health actually changes, except
/// for [`OccupancySignal::Disabled`] and [`OccupancySignal::Reset`] which always reach the
/// connection layer.
#[derive(Debug, Clone)]
pub struct OccupancyTracker {
    primary_channel: String,
    secondary_channel: String,
    primary: ChannelOccupancy,
    secondary: ChannelOccupancy,
    last_control_timestamp: i64,
    streaming_active: bool,
    declared: PushHealth,
}

impl OccupancyTracker {
    /// Default name of the primary monitoring channel.
    pub const DEFAULT_PRIMARY_CHANNEL: &'static str = "control_pri";
    /// Default name of the secondary monitoring channel.
    pub const DEFAULT_SECONDARY_CHANNEL: &'static str = "control_sec";

    /// Create a tracker for the given monitoring channel names.
    ///
    /// Starts optimistic: one publisher assumed on the primary channel.
    pub fn new(primary_channel: impl Into<String>, secondary_channel: impl Into<String>) -> Self {
        OccupancyTracker {
            primary_channel: primary_channel.into(),
            secondary_channel: secondary_channel.into(),
            primary: ChannelOccupancy {
                last_timestamp: 0,
                publishers: 1,
            },
            secondary: ChannelOccupancy {
                last_timestamp: 0,
                publishers: 0,
            },
            last_control_timestamp: 0,
            streaming_active: true,
            declared: PushHealth::Up,
        }
    }

    /// Health last declared.
    pub fn declared(&self) -> PushHealth {
        self.declared
    }

    /// `false` while a pause or disable control is in effect.
    pub fn is_streaming_active(&self) -> bool {
        self.streaming_active
    }

    /// Total publishers across both monitoring channels.
    pub fn publishers(&self) -> u32 {
        self.primary.publishers + self.secondary.publishers
    }

    /// Record a health transition announced by another component, so it is not repeated.
    pub fn set_declared(&mut self, health: PushHealth) {
        self.declared = health;
    }

    /// Apply an occupancy notification.
    pub fn handle_occupancy(&mut self, occupancy: &Occupancy) -> Option<OccupancySignal> {
        let channel = if occupancy.channel.contains(&self.primary_channel) {
            &mut self.primary
        } else if occupancy.channel.contains(&self.secondary_channel) {
            &mut self.secondary
        } else {
            log::warn!(target: "flagsync", channel = occupancy.channel.as_str(); "occupancy for unknown channel");
            return None;
        };

        if occupancy.timestamp <= channel.last_timestamp {
            log::trace!(target: "flagsync", channel = occupancy.channel.as_str(), timestamp = occupancy.timestamp; "dropping stale occupancy");
            return None;
        }
        *channel = ChannelOccupancy {
            last_timestamp: occupancy.timestamp,
            publishers: occupancy.publishers,
        };

        let publishers = self.publishers();
        match self.declared {
            PushHealth::Up if publishers == 0 => self.declare(PushHealth::Down),
            PushHealth::Down if publishers > 0 && self.streaming_active => {
                self.declare(PushHealth::Up)
            }
            _ => None,
        }
    }

    /// Apply a control notification.
    pub fn handle_control(&mut self, control: &Control) -> Option<OccupancySignal> {
        if control.timestamp <= self.last_control_timestamp {
            log::trace!(target: "flagsync", timestamp = control.timestamp; "dropping stale control");
            return None;
        }
        self.last_control_timestamp = control.timestamp;

        match control.control_type {
            ControlType::StreamingPaused => {
                self.streaming_active = false;
                self.declare(PushHealth::Down)
            }
            ControlType::StreamingDisabled => {
                self.streaming_active = false;
                self.declared = PushHealth::Down;
                Some(OccupancySignal::Disabled)
            }
            ControlType::StreamingResumed => {
                self.streaming_active = true;
                if self.publishers() > 0 {
                    self.declare(PushHealth::Up)
                } else {
                    None
                }
            }
            ControlType::StreamingReset => Some(OccupancySignal::Reset),
        }
    }

    fn declare(&mut self, health: PushHealth) -> Option<OccupancySignal> {
        if self.declared == health {
            return None;
        }
        self.declared = health;
        Some(match health {
            PushHealth::Up => OccupancySignal::Up,
            PushHealth::Down => OccupancySignal::Down,
        })
    }
}

impl Default for OccupancyTracker {
    fn default() -> Self {
        OccupancyTracker::new(
            OccupancyTracker::DEFAULT_PRIMARY_CHANNEL,
            OccupancyTracker::DEFAULT_SECONDARY_CHANNEL,
        )
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::{OccupancySignal, OccupancyTracker, PushHealth};
    use crate::codec::{Control, ControlType, Occupancy};

    const PRI: &str = "[?occupancy=metrics.publishers]control_pri";
    const SEC: &str = "[?occupancy=metrics.publishers]control_sec";

    fn occupancy(channel: &str, timestamp: i64, publishers: u32) -> Occupancy {
        Occupancy {
            channel: channel.to_owned(),
            timestamp,
            publishers,
        }
    }

    fn control(timestamp: i64, control_type: ControlType) -> Control {
        Control {
            timestamp,
            control_type,
        }
    }

    #[test]
    fn starts_up_with_one_primary_publisher() {
        let tracker = OccupancyTracker::default();

        assert_eq!(tracker.declared(), PushHealth::Up);
        assert_eq!(tracker.publishers(), 1);
        assert!(tracker.is_streaming_active());
    }

    #[test]
    fn down_once_then_up_once_then_stale_ignored() {
        let mut tracker = OccupancyTracker::default();

        assert_eq!(tracker.handle_occupancy(&occupancy(SEC, 10, 0)), None);
        assert_eq!(
            tracker.handle_occupancy(&occupancy(PRI, 11, 0)),
            Some(OccupancySignal::Down)
        );
        assert_eq!(tracker.handle_occupancy(&occupancy(PRI, 12, 0)), None);
        assert_eq!(
            tracker.handle_occupancy(&occupancy(SEC, 13, 1)),
            Some(OccupancySignal::Up)
        );
        assert_eq!(tracker.handle_occupancy(&occupancy(SEC, 9, 0)), None);

        assert_eq!(tracker.publishers(), 1);
        assert_eq!(tracker.declared(), PushHealth::Up);
    }

    #[test]
    fn equal_timestamp_is_stale() {
        let mut tracker = OccupancyTracker::default();
        tracker.handle_occupancy(&occupancy(PRI, 10, 0));

        assert_eq!(tracker.handle_occupancy(&occupancy(PRI, 10, 3)), None);
        assert_eq!(tracker.publishers(), 0);
    }

    #[test]
    fn unknown_channel_is_ignored() {
        let mut tracker = OccupancyTracker::default();

        assert_eq!(tracker.handle_occupancy(&occupancy("other", 10, 0)), None);
        assert_eq!(tracker.publishers(), 1);
    }

    #[test]
    fn pause_and_resume() {
        let mut tracker = OccupancyTracker::default();

        assert_eq!(
            tracker.handle_control(&control(1, ControlType::StreamingPaused)),
            Some(OccupancySignal::Down)
        );
        assert!(!tracker.is_streaming_active());
        // Publishers alone do not bring a paused stream back.
        assert_eq!(tracker.handle_occupancy(&occupancy(SEC, 2, 2)), None);
        assert_eq!(
            tracker.handle_control(&control(3, ControlType::StreamingResumed)),
            Some(OccupancySignal::Up)
        );
        assert!(tracker.is_streaming_active());
    }

    #[test]
    fn resume_without_publishers_stays_down() {
        let mut tracker = OccupancyTracker::default();
        tracker.handle_occupancy(&occupancy(PRI, 1, 0));

        assert_eq!(
            tracker.handle_control(&control(2, ControlType::StreamingResumed)),
            None
        );
        assert_eq!(tracker.declared(), PushHealth::Down);
    }

    #[test]
    fn stale_control_is_ignored() {
        let mut tracker = OccupancyTracker::default();
        tracker.handle_control(&control(5, ControlType::StreamingPaused));

        assert_eq!(
            tracker.handle_control(&control(5, ControlType::StreamingResumed)),
            None
        );
        assert_eq!(
            tracker.handle_control(&control(4, ControlType::StreamingResumed)),
            None
        );
        assert!(!tracker.is_streaming_active());
    }

    #[test]
    fn disable_and_reset_always_signal() {
        let mut tracker = OccupancyTracker::default();

        assert_eq!(
            tracker.handle_control(&control(1, ControlType::StreamingReset)),
            Some(OccupancySignal::Reset)
        );
        assert_eq!(
            tracker.handle_control(&control(2, ControlType::StreamingDisabled)),
            Some(OccupancySignal::Disabled)
        );
        assert!(!tracker.is_streaming_active());
    }

    #[test]
    fn transitions_only_when_aggregate_changes() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut tracker = OccupancyTracker::default();
        let mut counts = [1u32, 0u32];
        let mut stamps = [0i64, 0i64];
        let mut declared_up = true;

        for _ in 0..2_000 {
            let index = rng.gen_range(0..2);
            let timestamp = rng.gen_range(0..500);
            let publishers = rng.gen_range(0..3);
            let channel = if index == 0 { PRI } else { SEC };

            let signal = tracker.handle_occupancy(&occupancy(channel, timestamp, publishers));

            if timestamp <= stamps[index] {
                assert_eq!(signal, None, "stale message must not emit");
                continue;
            }
            stamps[index] = timestamp;
            counts[index] = publishers;
            let computed_up = counts[0] + counts[1] > 0;
            if computed_up != declared_up {
                let expected = if computed_up {
                    OccupancySignal::Up
                } else {
                    OccupancySignal::Down
                };
                assert_eq!(signal, Some(expected));
                declared_up = computed_up;
            } else {
                assert_eq!(signal, None);
            }
        }
    }
}
