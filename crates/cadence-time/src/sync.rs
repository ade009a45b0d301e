//! Federate-side clock synchronization with the RTI
//!
//! One exchange:
//! 1. RTI sends T1 (its clock); the federate records T2 on arrival
//! 2. Federate replies T3 and records its local delay T3 - T2
//! 3. RTI sends T4 (its clock at sending), then on UDP a coded probe T5
//!
//! Round trip = (T4 - T1) - (T3 - T2), clock error = round_trip / 2 - (T2 - T1).
//! A positive error means the federate is behind the RTI.

use cadence_core::{Instant, Interval, NSEC_PER_MSEC, NSEC_PER_USEC};
use serde::{Deserialize, Serialize};

/// Maximum tolerated discrepancy between the T4 and coded-probe spacing, and
/// maximum tolerated round-trip standard deviation within a window.
pub const CLOCK_SYNC_GUARD_BAND: Interval = 100 * NSEC_PER_USEC;

/// Default period between runtime synchronization rounds
pub const DEFAULT_CLOCK_SYNC_PERIOD: Interval = 5 * NSEC_PER_MSEC;

/// Channel a T4 arrived on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncChannel {
    /// Startup synchronization; errors are applied in full
    Tcp,
    /// Runtime synchronization; errors are attenuated and probe-filtered
    Udp,
}

/// Clock synchronization tuning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockSyncConfig {
    /// T4 messages per averaging window
    pub exchanges_per_interval: u32,
    /// Divisor applied to runtime errors before averaging
    pub attenuation: i64,
    pub guard_band: Interval,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        ClockSyncConfig {
            exchanges_per_interval: 10,
            attenuation: 10,
            guard_band: CLOCK_SYNC_GUARD_BAND,
        }
    }
}

/// Round-trip statistics for one window
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RoundTripStats {
    pub average: Interval,
    pub max: Interval,
    pub standard_deviation: Interval,
}

/// What a message did to the synchronization state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Waiting for the coded probe of this round
    AwaitingProbe,
    /// Folded into the running average; window not yet full
    Accumulated,
    /// Window complete: add this to the clock offset
    Apply(Interval),
    /// Probe spacing exceeded the guard band; round discarded
    ImpureProbe,
    /// Round-trip jitter exceeded the guard band; window discarded
    Unstable,
    /// Message arrived out of sequence
    Ignored,
}

#[derive(Clone, Copy, Debug)]
struct PendingRound {
    t4: Instant,
    r4: Instant,
    round_trip: Interval,
    error: Interval,
}

/// Estimator state for the connection to the RTI
#[derive(Debug)]
pub struct ClockSyncSession {
    config: ClockSyncConfig,
    /// RTI clock at T1
    t1: Option<Instant>,
    /// Local clock when T1 arrived
    t2: Instant,
    /// T3 - T2
    local_delay: Interval,
    pending: Option<PendingRound>,
    received_t4: u32,
    history: Interval,
    samples: Vec<Interval>,
    max_round_trip: Interval,
    max_error: Interval,
}

impl ClockSyncSession {
    pub fn new(config: ClockSyncConfig) -> Self {
        ClockSyncSession {
            config,
            t1: None,
            t2: 0,
            local_delay: 0,
            pending: None,
            received_t4: 0,
            history: 0,
            samples: Vec::new(),
            max_round_trip: 0,
            max_error: 0,
        }
    }

    pub fn config(&self) -> &ClockSyncConfig {
        &self.config
    }

    /// Record a T1 received at local time `t2`. The caller replies with T3.
    pub fn handle_t1(&mut self, t1: Instant, t2: Instant) {
        self.t1 = Some(t1);
        self.t2 = t2;
        self.pending = None;
    }

    /// Record the local time right after the T3 reply was written
    pub fn t3_sent(&mut self, t3: Instant) {
        self.local_delay = t3 - self.t2;
    }

    /// Process T4 sent by the RTI at `t4`, received locally at `r4`.
    pub fn handle_t4(&mut self, t4: Instant, r4: Instant, channel: SyncChannel) -> SyncOutcome {
        let Some(t1) = self.t1.take() else {
            return SyncOutcome::Ignored;
        };
        self.received_t4 += 1;

        let round_trip = (t4 - t1) - self.local_delay;
        let error = round_trip / 2 - (self.t2 - t1);
        tracing::debug!(round_trip, error, ?channel, "clock sync T4");

        match channel {
            SyncChannel::Udp => {
                self.pending = Some(PendingRound {
                    t4,
                    r4,
                    round_trip,
                    error,
                });
                SyncOutcome::AwaitingProbe
            }
            SyncChannel::Tcp => self.accumulate(round_trip, error, error),
        }
    }

    /// Process the coded probe sent at `t5`, received locally at `r5`.
    pub fn handle_coded_probe(&mut self, t5: Instant, r5: Instant) -> SyncOutcome {
        let Some(round) = self.pending.take() else {
            return SyncOutcome::Ignored;
        };

        let distance = ((r5 - round.r4) - (t5 - round.t4)).abs();
        if distance >= self.config.guard_band {
            tracing::debug!(
                distance,
                "clock sync: skipping round due to impure coded probes"
            );
            self.received_t4 = self.received_t4.saturating_sub(1);
            return SyncOutcome::ImpureProbe;
        }

        let adjustment = round.error / self.config.attenuation.max(1);
        self.accumulate(round.round_trip, round.error, adjustment)
    }

    /// Abandon a round whose coded probe never arrived
    pub fn abandon_round(&mut self) {
        if self.pending.take().is_some() {
            self.received_t4 = self.received_t4.saturating_sub(1);
        }
        self.t1 = None;
    }

    fn accumulate(&mut self, round_trip: Interval, error: Interval, adjustment: Interval) -> SyncOutcome {
        self.samples.push(round_trip);
        self.max_round_trip = self.max_round_trip.max(round_trip);
        self.max_error = self.max_error.max(error);

        let exchanges = self.config.exchanges_per_interval.max(1);
        self.history += adjustment / exchanges as Interval;

        if self.received_t4 < exchanges {
            return SyncOutcome::Accumulated;
        }

        let stats = self.round_trip_stats();
        if stats.standard_deviation >= self.config.guard_band {
            tracing::warn!(
                standard_deviation = stats.standard_deviation,
                "clock sync: large round-trip deviation, discarding window"
            );
            self.reset();
            return SyncOutcome::Unstable;
        }

        let offset = self.history;
        tracing::info!(
            adjustment = offset,
            round_trip_avg = stats.average,
            round_trip_max = stats.max,
            round_trip_sd = stats.standard_deviation,
            local_delay = self.local_delay,
            "clock sync: adjusting offset"
        );
        self.reset();
        SyncOutcome::Apply(offset)
    }

    /// Statistics over the current window
    pub fn round_trip_stats(&self) -> RoundTripStats {
        if self.samples.is_empty() {
            return RoundTripStats::default();
        }
        let n = self.samples.len() as Interval;
        let average = self.samples.iter().map(|s| s / n).sum::<Interval>();
        let max = self.samples.iter().copied().max().unwrap_or(0);
        let variance = self
            .samples
            .iter()
            .map(|s| {
                let delta = (s - average) as f64;
                delta * delta
            })
            .sum::<f64>()
            / n as f64;
        RoundTripStats {
            average,
            max,
            standard_deviation: variance.sqrt() as Interval,
        }
    }

    /// Largest clock error seen in the current window
    pub fn error_bound(&self) -> Interval {
        self.max_error
    }

    fn reset(&mut self) {
        self.received_t4 = 0;
        self.history = 0;
        self.samples.clear();
        self.max_round_trip = 0;
        self.max_error = 0;
    }
}

impl Default for ClockSyncSession {
    fn default() -> Self {
        Self::new(ClockSyncConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One exchange where the federate clock lags the RTI by `lag` and the
    /// one-way delay is `one_way`.
    fn exchange(
        session: &mut ClockSyncSession,
        rti_now: Instant,
        lag: Interval,
        one_way: Interval,
        channel: SyncChannel,
    ) -> SyncOutcome {
        let t1 = rti_now;
        let t2 = t1 + one_way - lag;
        session.handle_t1(t1, t2);
        session.t3_sent(t2 + 10);
        let t4 = t1 + 2 * one_way + 10;
        let r4 = t4 + one_way - lag;
        let outcome = session.handle_t4(t4, r4, channel);
        if channel == SyncChannel::Tcp {
            return outcome;
        }
        assert_eq!(outcome, SyncOutcome::AwaitingProbe);
        session.handle_coded_probe(t4 + 50, r4 + 50)
    }

    #[test]
    fn test_tcp_window_applies_full_error() {
        let mut session = ClockSyncSession::default();
        let mut outcome = SyncOutcome::Ignored;
        for i in 0..10 {
            outcome = exchange(&mut session, 1_000_000 * i, 5_000, 20_000, SyncChannel::Tcp);
            if i < 9 {
                assert_eq!(outcome, SyncOutcome::Accumulated);
            }
        }
        assert_eq!(outcome, SyncOutcome::Apply(5_000));
    }

    #[test]
    fn test_udp_window_attenuates() {
        let mut session = ClockSyncSession::default();
        let mut outcome = SyncOutcome::Ignored;
        for i in 0..10 {
            outcome = exchange(&mut session, 1_000_000 * i, 50_000, 20_000, SyncChannel::Udp);
        }
        assert_eq!(outcome, SyncOutcome::Apply(5_000));
    }

    #[test]
    fn test_impure_probe_discards_round() {
        let mut session = ClockSyncSession::default();
        session.handle_t1(0, 100);
        session.t3_sent(110);
        assert_eq!(
            session.handle_t4(1_000, 2_000, SyncChannel::Udp),
            SyncOutcome::AwaitingProbe
        );
        // Probe spacing differs by 200µs
        let outcome = session.handle_coded_probe(1_100, 2_100 + 200_000);
        assert_eq!(outcome, SyncOutcome::ImpureProbe);
        assert_eq!(session.received_t4, 0);
    }

    #[test]
    fn test_unstable_window_is_discarded() {
        let mut session = ClockSyncSession::default();
        let mut outcome = SyncOutcome::Ignored;
        for i in 0..10 {
            // Alternate between 10µs and 1ms one-way delays
            let one_way = if i % 2 == 0 { 10_000 } else { 1_000_000 };
            outcome = exchange(&mut session, 10_000_000 * i, 0, one_way, SyncChannel::Tcp);
        }
        assert_eq!(outcome, SyncOutcome::Unstable);
        assert_eq!(session.round_trip_stats(), RoundTripStats::default());
    }

    #[test]
    fn test_out_of_sequence_messages_ignored() {
        let mut session = ClockSyncSession::default();
        assert_eq!(
            session.handle_t4(10, 10, SyncChannel::Tcp),
            SyncOutcome::Ignored
        );
        assert_eq!(session.handle_coded_probe(10, 10), SyncOutcome::Ignored);
    }

    #[test]
    fn test_round_trip_stats() {
        let mut session = ClockSyncSession::default();
        session.samples = vec![100, 200, 300];
        let stats = session.round_trip_stats();
        assert_eq!(stats.average, 33 + 66 + 100);
        assert_eq!(stats.max, 300);
        assert!(stats.standard_deviation > 0);
    }

    proptest::proptest! {
        #[test]
        fn test_tcp_window_recovers_any_lag(lag in -1_000_000_000i64..1_000_000_000, one_way in 1i64..1_000_000) {
            let mut session = ClockSyncSession::default();
            let mut outcome = SyncOutcome::Ignored;
            for i in 0..10 {
                outcome = exchange(&mut session, 10_000_000 * i, lag, one_way, SyncChannel::Tcp);
            }
            // Each exchange contributes a tenth of the error, truncated
            proptest::prop_assert_eq!(outcome, SyncOutcome::Apply(lag / 10 * 10));
        }
    }
}
