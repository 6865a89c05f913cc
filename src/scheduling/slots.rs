//! Bookable slot computation from weekly availability windows.

use chrono::{Duration, NaiveTime};

use crate::db::TimeSlot;

pub const SLOT_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy)]
pub struct Window {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub break_minutes: i64,
}

/// 30-minute slots inside each window, `break_minutes` apart, minus any slot that
/// overlaps a booked `(start, end)` range. Output is sorted by start time.
pub fn compute_slots(windows: &[Window], booked: &[(NaiveTime, NaiveTime)]) -> Vec<TimeSlot> {
    let slot = Duration::minutes(SLOT_MINUTES);
    let mut slots = Vec::new();

    for window in windows {
        let step = slot + Duration::minutes(window.break_minutes.max(0));
        let mut start = window.start;
        loop {
            let (end, wrapped) = start.overflowing_add_signed(slot);
            if wrapped != 0 || end > window.end {
                break;
            }

            let taken = booked.iter().any(|(b_start, b_end)| start < *b_end && end > *b_start);
            if !taken {
                slots.push((start, end));
            }

            let (next, wrapped) = start.overflowing_add_signed(step);
            if wrapped != 0 {
                break;
            }
            start = next;
        }
    }

    slots.sort();
    slots.dedup();
    slots
        .into_iter()
        .map(|(start, end)| TimeSlot {
            start_time: start.format("%H:%M").to_string(),
            end_time: end.format("%H:%M").to_string(),
        })
        .collect()
}
