use std::fmt;

use mqtt3_packet::Type;

use crate::error::{Error, Result};
use crate::handlers::Subscription;
use crate::timer::Timer;

/// Upper bound on concurrently in-flight acknowledgments. Reaching it is a
/// publish/subscribe failure, not a retry trigger.
pub const ACK_HANDLER_MAX: usize = 64;

/// One in-flight request awaiting its acknowledgment.
///
/// The serialized request bytes are retained verbatim for retransmission.
/// SUBACK/UNSUBACK records additionally carry the subscription whose
/// registration they decide.
pub struct AckRecord {
    pub expect: Type,
    pub packet_id: u16,
    pub deadline: Timer,
    pub payload: Vec<u8>,
    pub subscription: Option<Subscription>,
}

impl fmt::Debug for AckRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AckRecord")
            .field("expect", &self.expect)
            .field("packet_id", &self.packet_id)
            .field("payload_len", &self.payload.len())
            .field("subscription", &self.subscription)
            .finish()
    }
}

/// How [`AckList::scan`] selects records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Process every record, used right after a reconnect.
    Immediate,
    /// Skip records whose deadline has not yet passed.
    Deadline,
}

/// What a scan pass decided: requests to put back on the wire and
/// subscription registrations that expired unanswered, tagged with the
/// acknowledgment they were waiting for.
#[derive(Default)]
pub struct ScanOutcome {
    pub resend: Vec<Vec<u8>>,
    pub expired: Vec<(Type, Subscription)>,
}

/// The in-flight acknowledgment table behind QoS 1/2 reliability and
/// subscription-registration atomicity.
#[derive(Debug, Default)]
pub struct AckList {
    records: Vec<AckRecord>,
}

impl AckList {
    pub fn new() -> Self {
        AckList {
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= ACK_HANDLER_MAX
    }

    pub fn exists(&self, expect: Type, packet_id: u16) -> bool {
        self.records
            .iter()
            .any(|record| record.expect == expect && record.packet_id == packet_id)
    }

    /// Inserts a record for an outbound request, retaining its serialized
    /// bytes and arming the expiry deadline.
    pub fn record(
        &mut self,
        expect: Type,
        packet_id: u16,
        payload: &[u8],
        subscription: Option<Subscription>,
        timeout_ms: u64,
    ) -> Result<()> {
        if self.exists(expect, packet_id) {
            return Err(Error::AckNodeExists);
        }
        if self.is_full() {
            return Err(Error::AckTableFull);
        }

        let mut deadline = Timer::new();
        deadline.countdown_ms(timeout_ms);

        self.records.push(AckRecord {
            expect,
            packet_id,
            deadline,
            payload: payload.to_vec(),
            subscription,
        });

        Ok(())
    }

    /// Removes every record matching (type, packet id) and returns the
    /// subscription of the last match, if any carried one.
    pub fn unrecord(&mut self, expect: Type, packet_id: u16) -> Option<Subscription> {
        let mut subscription = None;
        let mut i = 0;

        while i < self.records.len() {
            if self.records[i].expect == expect && self.records[i].packet_id == packet_id {
                subscription = self.records.remove(i).subscription;
            } else {
                i += 1;
            }
        }

        subscription
    }

    /// Walks the table, retransmitting QoS continuations and reaping
    /// expired registrations.
    ///
    /// QoS 1/2 records (PUBACK/PUBREC/PUBREL/PUBCOMP expectations) have
    /// their retained bytes queued for resend and the deadline re-armed;
    /// they stay in the table. Expired SUBACK/UNSUBACK records are removed
    /// along with their subscription. Anything else is dropped.
    pub fn scan(&mut self, mode: ScanMode, timeout_ms: u64) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();
        let mut i = 0;

        while i < self.records.len() {
            if mode == ScanMode::Deadline && !self.records[i].deadline.expired() {
                i += 1;
                continue;
            }

            match self.records[i].expect {
                Type::PUBACK | Type::PUBREC | Type::PUBREL | Type::PUBCOMP => {
                    let record = &mut self.records[i];
                    record.deadline.countdown_ms(timeout_ms);
                    outcome.resend.push(record.payload.clone());
                    i += 1;
                }
                Type::SUBACK | Type::UNSUBACK => {
                    let record = self.records.remove(i);
                    if let Some(subscription) = record.subscription {
                        outcome.expired.push((record.expect, subscription));
                    }
                }
                _ => {
                    warn!("dropping unexpected ack record {:?}", self.records[i]);
                    self.records.remove(i);
                }
            }
        }

        outcome
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
