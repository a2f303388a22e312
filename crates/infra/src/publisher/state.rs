//! Connection state of the resilient publisher.

use std::time::Duration;

/// Where the publisher's broker session stands.
///
/// ```text
/// Disconnected ──connect──► Connecting ──ok──► Connected
///                             │    ▲               │ lost
///                        fail │    │ backoff       ▼
///                             └──► Reconnecting{n} ◄┘
///                                       │ n > max
///                                       ▼
///                                   Exhausted
/// (any) ──close──► Closing ──► Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    Connected,
    /// Waiting out the backoff before retry number `attempt`.
    Reconnecting { attempt: u32 },
    /// Gave up after `attempts` consecutive failures. An explicit connect or a publish
    /// can still try again.
    Exhausted { attempts: u32 },
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Nothing is in flight and nobody asked to shut down.
    pub fn can_connect(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected
                | ConnectionState::Reconnecting { .. }
                | ConnectionState::Exhausted { .. }
        )
    }

    pub fn is_shutting_down(&self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            ConnectionState::Exhausted { attempts } => {
                write!(f, "exhausted after {attempts} attempts")
            }
            ConnectionState::Closing => f.write_str("closing"),
            ConnectionState::Closed => f.write_str("closed"),
        }
    }
}

/// Wait before reconnect attempt `attempt` (1-indexed): `min(base * 2^(attempt-1), max)`.
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    2u32.checked_pow(attempt - 1)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BASE: Duration = Duration::from_millis(1000);
    const MAX: Duration = Duration::from_millis(30_000);

    #[test]
    fn delays_double_until_capped() {
        let delays: Vec<u64> = (1..=8)
            .map(|n| reconnect_delay(n, BASE, MAX).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000, 30_000]);
    }

    #[test]
    fn huge_attempt_numbers_stay_capped() {
        assert_eq!(reconnect_delay(u32::MAX, BASE, MAX), MAX);
    }

    #[test]
    fn only_idle_states_may_start_a_connect() {
        assert!(ConnectionState::Disconnected.can_connect());
        assert!(ConnectionState::Reconnecting { attempt: 2 }.can_connect());
        assert!(ConnectionState::Exhausted { attempts: 10 }.can_connect());

        assert!(!ConnectionState::Connecting.can_connect());
        assert!(!ConnectionState::Connected.can_connect());
        assert!(!ConnectionState::Closing.can_connect());
        assert!(!ConnectionState::Closed.can_connect());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn backoff_is_monotone_and_bounded(attempt in 1u32..64) {
            let current = reconnect_delay(attempt, BASE, MAX);
            let next = reconnect_delay(attempt + 1, BASE, MAX);
            prop_assert!(current <= next);
            prop_assert!(next <= MAX);
            prop_assert!(current >= BASE);
        }
    }
}
