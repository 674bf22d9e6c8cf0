// Copyright (c) 2025, The Notify Authors
// MIT License
// All rights reserved.

//! # Retry/DLQ Escalation Policy
//!
//! Pure decision logic for failed deliveries. Each failed attempt bumps the
//! `x-retry-count` header and republishes the message: below the configured
//! maximum it goes to the retry exchange, whose queues dead-letter back to
//! the main queue after a TTL; at the maximum it goes to the dead-letter
//! exchange for good. The broker side of this wiring is declared by
//! [`crate::topology`].

use lapin::types::{AMQPValue, FieldTable, LongLongInt, ShortString};

/// Header carrying the number of processing attempts a message has consumed.
/// Absent means the message has never failed.
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";

/// Outcome of the escalation policy for one failed delivery.
///
/// `attempts` is the value the `x-retry-count` header must carry on the
/// republished message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Republish to the retry exchange; the broker redelivers after the TTL.
    Retry { attempts: i64 },
    /// Attempts exhausted; republish to the dead-letter exchange.
    DeadLetter { attempts: i64 },
}

impl Escalation {
    /// Decides what to do with a delivery that has just failed.
    ///
    /// `retry_count` is the count read from the incoming headers (0 for a
    /// first failure); `retry_max` is the configured ceiling on total
    /// attempts.
    pub fn decide(retry_count: i64, retry_max: i64) -> Escalation {
        let attempts = retry_count + 1;
        if attempts >= retry_max {
            Escalation::DeadLetter { attempts }
        } else {
            Escalation::Retry { attempts }
        }
    }

    /// The `x-retry-count` value for the republished message.
    pub fn attempts(&self) -> i64 {
        match self {
            Escalation::Retry { attempts } | Escalation::DeadLetter { attempts } => *attempts,
        }
    }
}

/// Reads the retry count out of a delivery's header table.
///
/// Missing table, missing key and non-integral values all read as zero, so a
/// message published without the header starts a fresh attempt sequence.
pub fn retry_count(headers: Option<&FieldTable>) -> i64 {
    let Some(headers) = headers else {
        return 0;
    };

    match headers.inner().get(AMQP_HEADERS_RETRY_COUNT) {
        Some(AMQPValue::LongLongInt(v)) => *v,
        Some(AMQPValue::LongInt(v)) => i64::from(*v),
        Some(AMQPValue::ShortInt(v)) => i64::from(*v),
        Some(AMQPValue::LongUInt(v)) => i64::from(*v),
        _ => 0,
    }
}

/// Copies the header table with `x-retry-count` set to `attempts`, keeping
/// every other header (trace context included) intact.
pub fn with_retry_count(headers: Option<&FieldTable>, attempts: i64) -> FieldTable {
    let mut table = headers.cloned().unwrap_or_default();
    table.insert(
        ShortString::from(AMQP_HEADERS_RETRY_COUNT),
        AMQPValue::LongLongInt(LongLongInt::from(attempts)),
    );
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failures_go_to_retry() {
        assert_eq!(Escalation::decide(0, 3), Escalation::Retry { attempts: 1 });
        assert_eq!(Escalation::decide(1, 3), Escalation::Retry { attempts: 2 });
    }

    #[test]
    fn final_failure_goes_to_dead_letter() {
        assert_eq!(
            Escalation::decide(2, 3),
            Escalation::DeadLetter { attempts: 3 }
        );
        // Counts past the ceiling still dead-letter, never retry again.
        assert_eq!(
            Escalation::decide(7, 3),
            Escalation::DeadLetter { attempts: 8 }
        );
    }

    #[test]
    fn retry_max_one_dead_letters_immediately() {
        assert_eq!(
            Escalation::decide(0, 1),
            Escalation::DeadLetter { attempts: 1 }
        );
    }

    #[test]
    fn missing_headers_read_as_zero() {
        assert_eq!(retry_count(None), 0);
        assert_eq!(retry_count(Some(&FieldTable::default())), 0);
    }

    #[test]
    fn integral_header_variants_are_accepted() {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongLongInt(2),
        );
        assert_eq!(retry_count(Some(&table)), 2);

        let mut table = FieldTable::default();
        table.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongInt(5),
        );
        assert_eq!(retry_count(Some(&table)), 5);

        let mut table = FieldTable::default();
        table.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongString("not a number".into()),
        );
        assert_eq!(retry_count(Some(&table)), 0);
    }

    #[test]
    fn with_retry_count_preserves_other_headers() {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString("00-abc-def-01".into()),
        );

        let bumped = with_retry_count(Some(&table), 4);
        assert_eq!(retry_count(Some(&bumped)), 4);
        assert!(bumped.inner().contains_key(&ShortString::from("traceparent")));
    }

    #[test]
    fn with_retry_count_overwrites_previous_value() {
        let bumped = with_retry_count(None, 1);
        let bumped = with_retry_count(Some(&bumped), 2);
        assert_eq!(retry_count(Some(&bumped)), 2);
    }
}
