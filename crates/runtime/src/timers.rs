use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::host::{HostState, get_arg, opt_arg};
use crate::resource::{Resource, TimerResource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
  deadline: Instant,
  /// Tie-breaker: equal deadlines fire in insertion order.
  seq: u64,
  id: u64,
  interval: Option<Duration>,
}

impl Ord for Entry {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    return (self.deadline, self.seq).cmp(&(other.deadline, other.seq));
  }
}

impl PartialOrd for Entry {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    return Some(self.cmp(other));
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DueTimer {
  pub id: u64,
  pub rearmed: bool,
}

/// Deadline-ordered wheel driven by the event loop. Cancellation marks the
/// id; marked entries are skipped when they surface.
pub struct TimerWheel {
  heap: BinaryHeap<Reverse<Entry>>,
  cancelled: HashSet<u64>,
  seq: u64,
}

impl Default for TimerWheel {
  fn default() -> Self {
    return Self::new();
  }
}

impl TimerWheel {
  pub fn new() -> Self {
    return Self {
      heap: BinaryHeap::new(),
      cancelled: HashSet::new(),
      seq: 0,
    };
  }

  pub fn insert(&mut self, id: u64, deadline: Instant, interval: Option<Duration>) {
    let seq = self.seq;
    self.seq += 1;
    self.cancelled.remove(&id);
    self.heap.push(Reverse(Entry {
      deadline,
      seq,
      id,
      interval,
    }));
  }

  /// Idempotent.
  pub fn cancel(&mut self, id: u64) {
    self.cancelled.insert(id);
  }

  /// Earliest scheduled wake-up. May belong to a cancelled entry; the
  /// caller wakes, pops nothing, and re-arms with the next deadline.
  pub fn next_deadline(&self) -> Option<Instant> {
    return self.heap.peek().map(|Reverse(e)| e.deadline);
  }

  pub fn has_active(&self) -> bool {
    return self
      .heap
      .iter()
      .any(|Reverse(e)| !self.cancelled.contains(&e.id));
  }

  /// Pop the earliest due entry, skipping cancelled ones. Interval timers
  /// re-arm to `deadline + interval` before being returned.
  pub fn pop_due(&mut self, now: Instant) -> Option<DueTimer> {
    while let Some(Reverse(entry)) = self.heap.peek().copied() {
      if entry.deadline > now {
        return None;
      }
      self.heap.pop();

      if self.cancelled.remove(&entry.id) {
        continue;
      }

      let rearmed = match entry.interval {
        Some(interval) => {
          let seq = self.seq;
          self.seq += 1;
          self.heap.push(Reverse(Entry {
            deadline: entry.deadline + interval,
            seq,
            id: entry.id,
            interval: entry.interval,
          }));
          true
        }
        None => false,
      };

      return Some(DueTimer {
        id: entry.id,
        rearmed,
      });
    }
    return None;
  }
}

pub(crate) fn register(
  runtime: &mut rustyscript::Runtime,
  state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  {
    let state = state.clone();
    runtime.register_function("timer_set", move |args: &[serde_json::Value]| {
      let delay_ms: f64 = get_arg(args, 0)?;
      let repeat: bool = opt_arg(args, 1).unwrap_or(false);
      if !delay_ms.is_finite() {
        return Err(crate::error::HostError::invalid_input("invalid timer delay").into());
      }

      // Negative delays clamp to zero, like the web timers they back.
      let delay = Duration::from_secs_f64(delay_ms.max(0.0) / 1000.0);
      let id = state
        .resources
        .insert(Resource::Timer(TimerResource { interval: repeat }));
      state
        .timers
        .lock()
        .insert(id, Instant::now() + delay, repeat.then_some(delay));
      return Ok(id.into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("timer_clear", move |args: &[serde_json::Value]| {
      let id: u64 = get_arg(args, 0)?;
      // Clearing an unknown or already-fired timer is a no-op.
      state.timers.lock().cancel(id);
      state.resources.remove(id);
      return Ok(serde_json::Value::Null);
    })?;
  }
  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_equal_deadlines_fire_in_insertion_order() {
    let mut wheel = TimerWheel::new();
    let now = Instant::now();

    wheel.insert(10, now, None);
    wheel.insert(11, now, None);
    wheel.insert(12, now, None);

    let order: Vec<u64> = std::iter::from_fn(|| wheel.pop_due(now).map(|t| t.id)).collect();
    assert_eq!(vec![10, 11, 12], order);
    assert!(!wheel.has_active());
  }

  #[test]
  fn test_cancelled_entries_are_skipped() {
    let mut wheel = TimerWheel::new();
    let now = Instant::now();

    wheel.insert(1, now, None);
    wheel.insert(2, now, None);
    wheel.cancel(1);

    assert_eq!(Some(DueTimer { id: 2, rearmed: false }), wheel.pop_due(now));
    assert_eq!(None, wheel.pop_due(now));
  }

  #[test]
  fn test_interval_rearms_to_deadline_plus_interval() {
    let mut wheel = TimerWheel::new();
    let now = Instant::now();
    let interval = Duration::from_millis(50);

    wheel.insert(7, now, Some(interval));

    let due = wheel.pop_due(now).unwrap();
    assert!(due.rearmed);
    assert_eq!(Some(now + interval), wheel.next_deadline());

    // Not due yet at `now`.
    assert_eq!(None, wheel.pop_due(now));
    assert_eq!(Some(DueTimer { id: 7, rearmed: true }), wheel.pop_due(now + interval));
  }

  #[test]
  fn test_not_due_before_deadline() {
    let mut wheel = TimerWheel::new();
    let now = Instant::now();
    wheel.insert(3, now + Duration::from_secs(60), None);

    assert_eq!(None, wheel.pop_due(now));
    assert!(wheel.has_active());
  }
}
