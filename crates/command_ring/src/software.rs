use std::collections::VecDeque;

use kick_protocol::{CompletionCounter, HardwareAddress, RingClass, RingRange};
use tracing::trace;

use crate::{CommandRing, RingConfig, RingMark, RingReservation, RingReserveError};

#[derive(Debug, Clone, Copy)]
struct OpenReservation {
    offset: u32,
    words: u32,
    padding: u32,
}

#[derive(Debug, Clone, Copy)]
struct InFlightSpan {
    words: u32,
    counter_value: u32,
}

/// Host-memory ring used by the simulator and tests.
///
/// Space handed to a kick is only reused after the ring counter confirms that kick, so the
/// write head never overruns words the hardware may still read.
#[derive(Debug)]
pub struct SoftwareRing {
    class: RingClass,
    config: RingConfig,
    base_address: HardwareAddress,
    words: Vec<u32>,
    counter: CompletionCounter,
    write_offset: u32,
    submitted_offset: u32,
    pending_words: u32,
    used_words: u32,
    open_reservation: Option<OpenReservation>,
    in_flight: VecDeque<InFlightSpan>,
}

impl SoftwareRing {
    pub fn new(class: RingClass, config: RingConfig, base_address: HardwareAddress) -> Self {
        assert!(config.capacity_words > 0, "ring capacity must be at least 1 word");
        assert!(
            config.max_words_per_kick <= config.capacity_words,
            "per-kick capacity {} exceeds ring capacity {}",
            config.max_words_per_kick,
            config.capacity_words
        );
        Self {
            class,
            config,
            base_address,
            words: vec![0; config.capacity_words as usize],
            counter: CompletionCounter::new(),
            write_offset: 0,
            submitted_offset: 0,
            pending_words: 0,
            used_words: 0,
            open_reservation: None,
            in_flight: VecDeque::new(),
        }
    }

    pub fn free_words(&self) -> u32 {
        self.config.capacity_words - self.used_words
    }

    pub fn in_flight_kicks(&self) -> usize {
        self.in_flight.len()
    }

    pub fn committed_offset(&self) -> u32 {
        self.write_offset
    }

    pub fn submitted_offset(&self) -> u32 {
        self.submitted_offset
    }

    fn retire_consumed(&mut self) {
        while let Some(span) = self.in_flight.front() {
            if !self.counter.is_reached(span.counter_value) {
                break;
            }
            trace!(
                class = %self.class,
                words = span.words,
                value = span.counter_value,
                "ring space retired"
            );
            self.used_words -= span.words;
            self.in_flight.pop_front();
        }
    }
}

impl CommandRing for SoftwareRing {
    fn class(&self) -> RingClass {
        self.class
    }

    fn reserve(&mut self, words: u32) -> Result<RingReservation, RingReserveError> {
        if self.open_reservation.is_some() {
            panic!("{} ring already has an open reservation", self.class);
        }
        if words > self.config.max_words_per_kick {
            return Err(RingReserveError::RequestTooLarge {
                class: self.class,
                words,
            });
        }
        if self.pending_words + words > self.config.max_words_per_kick {
            return Err(RingReserveError::KickCapacityExceeded { class: self.class });
        }

        self.retire_consumed();

        let tail_words = self.config.capacity_words - self.write_offset;
        let (offset, padding) = if words <= tail_words {
            (self.write_offset, 0)
        } else {
            (0, tail_words)
        };
        if self.free_words() < padding + words {
            return Err(RingReserveError::OutOfSpace {
                class: self.class,
                words,
            });
        }

        self.used_words += padding + words;
        self.open_reservation = Some(OpenReservation {
            offset,
            words,
            padding,
        });
        Ok(RingReservation {
            class: self.class,
            offset,
            words,
        })
    }

    fn words_mut(&mut self, reservation: &RingReservation) -> &mut [u32] {
        let Some(open) = self.open_reservation else {
            panic!("{} ring has no open reservation to write", self.class);
        };
        if open.offset != reservation.offset || open.words != reservation.words {
            panic!("{} ring reservation does not match the open one", self.class);
        }
        let start = open.offset as usize;
        &mut self.words[start..start + open.words as usize]
    }

    fn commit(&mut self, words: u32) {
        let Some(open) = self.open_reservation.take() else {
            panic!("{} ring commit without an open reservation", self.class);
        };
        if words > open.words {
            panic!(
                "{} ring commit of {words} words exceeds reservation of {}",
                self.class, open.words
            );
        }
        self.used_words -= open.words - words;
        self.pending_words += open.padding + words;
        self.write_offset = (open.offset + words) % self.config.capacity_words;
    }

    fn hardware_address(&self, offset: u32) -> HardwareAddress {
        self.base_address + HardwareAddress::from(offset) * 4
    }

    fn pending_range(&self) -> Option<RingRange> {
        if self.pending_words == 0 {
            return None;
        }
        Some(RingRange {
            class: self.class,
            start: self.submitted_offset,
            end: self.write_offset,
            start_address: self.hardware_address(self.submitted_offset),
        })
    }

    fn counter(&self) -> &CompletionCounter {
        &self.counter
    }

    fn mark_submitted(&mut self, range: RingRange, counter_value: u32) {
        if range.end != self.write_offset || range.start != self.submitted_offset {
            panic!(
                "{} ring submitted range {}..{} does not match pending {}..{}",
                self.class, range.start, range.end, self.submitted_offset, self.write_offset
            );
        }
        self.in_flight.push_back(InFlightSpan {
            words: self.pending_words,
            counter_value,
        });
        self.submitted_offset = self.write_offset;
        self.pending_words = 0;
    }

    fn discard_pending(&mut self) {
        if self.open_reservation.is_some() {
            panic!("{} ring cannot discard with an open reservation", self.class);
        }
        self.used_words -= self.pending_words;
        self.pending_words = 0;
        self.write_offset = self.submitted_offset;
    }

    fn mark(&self) -> RingMark {
        RingMark {
            class: self.class,
            write_offset: self.write_offset,
            pending_words: self.pending_words,
        }
    }

    fn rewind_to(&mut self, mark: RingMark) {
        if self.open_reservation.is_some() {
            panic!("{} ring cannot rewind with an open reservation", self.class);
        }
        if mark.class != self.class || mark.pending_words > self.pending_words {
            panic!(
                "{} ring cannot rewind to a mark from another ring or before its last submission",
                self.class
            );
        }
        self.used_words -= self.pending_words - mark.pending_words;
        self.pending_words = mark.pending_words;
        self.write_offset = mark.write_offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(capacity_words: u32, max_words_per_kick: u32) -> SoftwareRing {
        SoftwareRing::new(
            RingClass::ControlStream,
            RingConfig {
                capacity_words,
                max_words_per_kick,
            },
            0x4000,
        )
    }

    fn append(ring: &mut SoftwareRing, words: u32) -> RingReservation {
        let reservation = ring.reserve(words).expect("reserve ring words");
        ring.words_mut(&reservation).fill(0xAB);
        ring.commit(words);
        reservation
    }

    #[test]
    fn reports_single_kick_capacity_before_space() {
        let mut ring = ring(64, 8);
        append(&mut ring, 6);

        assert_eq!(
            ring.reserve(4),
            Err(RingReserveError::KickCapacityExceeded {
                class: RingClass::ControlStream
            })
        );
    }

    #[test]
    fn submitted_space_is_reused_only_after_counter_confirms() {
        let mut ring = ring(16, 8);
        append(&mut ring, 8);
        let range = ring.pending_range().expect("pending words");
        let value = ring.counter().reserve_next();
        ring.mark_submitted(range, value);
        append(&mut ring, 8);
        let range = ring.pending_range().expect("pending words");
        let second_value = ring.counter().reserve_next();
        ring.mark_submitted(range, second_value);

        assert_eq!(
            ring.reserve(4),
            Err(RingReserveError::OutOfSpace {
                class: RingClass::ControlStream,
                words: 4
            })
        );

        ring.counter().signal(value);
        let reservation = ring.reserve(4).expect("space retired by first kick");
        assert_eq!(reservation.offset, 0);
        assert_eq!(ring.in_flight_kicks(), 1);
    }

    #[test]
    fn wraps_to_start_and_accounts_padding() {
        let mut ring = ring(10, 8);
        append(&mut ring, 6);
        let range = ring.pending_range().expect("pending words");
        let value = ring.counter().reserve_next();
        ring.mark_submitted(range, value);
        ring.counter().signal(value);

        let reservation = append(&mut ring, 5);

        assert_eq!(reservation.offset, 0);
        let pending = ring.pending_range().expect("pending words after wrap");
        assert_eq!((pending.start, pending.end), (6, 5));
        assert_eq!(ring.free_words(), 1);
    }

    #[test]
    fn discard_rewinds_to_submitted_offset() {
        let mut ring = ring(32, 16);
        append(&mut ring, 4);
        let range = ring.pending_range().expect("pending words");
        let value = ring.counter().reserve_next();
        ring.mark_submitted(range, value);
        append(&mut ring, 3);

        ring.discard_pending();

        assert!(ring.pending_range().is_none());
        assert_eq!(ring.committed_offset(), 4);
        assert_eq!(ring.free_words(), 28);
    }

    #[test]
    fn rewind_returns_wrapped_words_and_padding() {
        let mut ring = ring(10, 8);
        append(&mut ring, 6);
        let range = ring.pending_range().expect("pending words");
        let value = ring.counter().reserve_next();
        ring.mark_submitted(range, value);
        ring.counter().signal(value);
        let mark = ring.mark();

        append(&mut ring, 5);
        ring.rewind_to(mark);

        assert!(ring.pending_range().is_none());
        assert_eq!(ring.committed_offset(), 6);
        assert_eq!(ring.free_words(), 10);
    }

    #[test]
    fn partial_commit_returns_unused_words() {
        let mut ring = ring(32, 16);
        let reservation = ring.reserve(10).expect("reserve ten words");
        ring.words_mut(&reservation)[..4].fill(1);
        ring.commit(4);

        assert_eq!(ring.free_words(), 28);
        assert_eq!(ring.committed_offset(), 4);
        assert_eq!(ring.hardware_address(4), 0x4000 + 16);
    }

    #[test]
    #[should_panic(expected = "already has an open reservation")]
    fn second_reservation_without_commit_panics() {
        let mut ring = ring(32, 16);
        let _first = ring.reserve(2).expect("reserve two words");
        let _ = ring.reserve(2);
    }
}
