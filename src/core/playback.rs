//! Gapless playback scheduling against an output device clock.
//!
//! Each decoded frame starts at `max(next_start_time, now)` and pushes the
//! cursor forward by exactly its duration, so frames that arrive ahead of the
//! clock play back to back. A frame that arrives late starts immediately.
//!
//! `flush` stops everything in flight, resets the cursor to the current clock
//! time and bumps the generation. Frames tagged with an older generation are
//! refused by [`PlaybackScheduler::enqueue_for`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::codec::AudioFrame;
use crate::core::devices::{DeviceError, DeviceResult, OutputDevice};

/// A buffer handed to the output device with its absolute start time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackItem {
    pub id: u64,
    pub start_time: Duration,
    pub duration: Duration,
    /// Flush generation the item was scheduled in
    pub generation: u64,
}

impl PlaybackItem {
    pub fn end_time(&self) -> Duration {
        self.start_time + self.duration
    }
}

#[derive(Debug)]
struct SchedulerState {
    next_start_time: Duration,
    in_flight: HashMap<u64, PlaybackItem>,
    next_id: u64,
    generation: u64,
}

/// Owns the output device while a session is active.
pub struct PlaybackScheduler {
    device: Arc<dyn OutputDevice>,
    state: Arc<Mutex<SchedulerState>>,
}

impl PlaybackScheduler {
    /// Start scheduling on `device`, with the cursor at its current time.
    pub fn new(device: Arc<dyn OutputDevice>) -> Self {
        let now = device.current_time();
        Self {
            device,
            state: Arc::new(Mutex::new(SchedulerState {
                next_start_time: now,
                in_flight: HashMap::new(),
                next_id: 1,
                generation: 0,
            })),
        }
    }

    /// Current output clock time.
    pub fn clock_now(&self) -> Duration {
        self.device.current_time()
    }

    pub fn sample_rate(&self) -> u32 {
        self.device.sample_rate()
    }

    pub fn next_start_time(&self) -> Duration {
        self.state.lock().next_start_time
    }

    /// Generation that new frames are scheduled in.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Items scheduled or playing, ordered by start time.
    pub fn in_flight(&self) -> Vec<PlaybackItem> {
        let mut items: Vec<PlaybackItem> = self.state.lock().in_flight.values().cloned().collect();
        items.sort_by_key(|item| (item.start_time, item.id));
        items
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Schedule `frame` in the current generation.
    pub fn enqueue(&self, frame: AudioFrame) -> DeviceResult<PlaybackItem> {
        let mut state = self.state.lock();
        self.schedule(&mut state, frame)
    }

    /// Schedule `frame` only if no flush happened since `generation` was read.
    /// Returns `Ok(None)` for a frame from a voided turn.
    pub fn enqueue_for(
        &self,
        generation: u64,
        frame: AudioFrame,
    ) -> DeviceResult<Option<PlaybackItem>> {
        let mut state = self.state.lock();
        if generation != state.generation {
            tracing::debug!(
                "Discarding frame from voided generation {} (current {})",
                generation,
                state.generation
            );
            return Ok(None);
        }
        self.schedule(&mut state, frame).map(Some)
    }

    fn schedule(&self, state: &mut SchedulerState, frame: AudioFrame) -> DeviceResult<PlaybackItem> {
        let now = self.device.current_time();
        let start_time = state.next_start_time.max(now);
        if start_time > state.next_start_time && !state.in_flight.is_empty() {
            tracing::debug!(
                "Late audio: {:?} behind the clock",
                start_time - state.next_start_time
            );
        }

        let item = PlaybackItem {
            id: state.next_id,
            start_time,
            duration: frame.duration(),
            generation: state.generation,
        };

        let on_ended = ended_callback(Arc::downgrade(&self.state), item.id);
        self.device
            .play_at(item.id, frame, item.start_time, on_ended)?;

        state.next_id += 1;
        state.next_start_time = item.end_time();
        state.in_flight.insert(item.id, item.clone());
        tracing::trace!(
            "Scheduled playback item {} at {:?} for {:?}",
            item.id,
            item.start_time,
            item.duration
        );
        Ok(item)
    }

    /// Stop everything in flight and reset the cursor to the clock.
    /// Returns the number of items stopped.
    pub fn flush(&self) -> usize {
        let mut state = self.state.lock();
        let stopped = state.in_flight.len();
        for id in state.in_flight.keys() {
            self.device.stop(*id);
        }
        state.in_flight.clear();
        state.next_start_time = self.device.current_time();
        state.generation += 1;

        tracing::debug!(
            "Playback flushed: {} item(s) stopped, cursor reset to {:?}",
            stopped,
            state.next_start_time
        );
        stopped
    }

    /// Flush and release the output device.
    pub async fn close(&self) -> DeviceResult<()> {
        self.flush();
        let device = self.device.clone();
        tokio::task::spawn_blocking(move || device.close())
            .await
            .map_err(|e| DeviceError::Io(format!("output close failed: {e}")))?
    }
}

fn ended_callback(state: Weak<Mutex<SchedulerState>>, id: u64) -> Box<dyn FnOnce() + Send> {
    Box::new(move || {
        if let Some(state) = state.upgrade() {
            state.lock().in_flight.remove(&id);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::devices::ManualOutput;

    const RATE: u32 = 24000;

    fn frame_ms(ms: u64) -> AudioFrame {
        AudioFrame::new(vec![100; (RATE as u64 * ms / 1000) as usize], RATE, 1).unwrap()
    }

    fn scheduler_at(t0: Duration) -> (PlaybackScheduler, ManualOutput) {
        let output = ManualOutput::starting_at(RATE, t0);
        (PlaybackScheduler::new(Arc::new(output.clone())), output)
    }

    #[test]
    fn test_back_to_back_scheduling() {
        let t0 = Duration::from_millis(1500);
        let (scheduler, output) = scheduler_at(t0);
        let d = Duration::from_millis(40);

        let starts: Vec<Duration> = (0..3)
            .map(|_| scheduler.enqueue(frame_ms(40)).unwrap().start_time)
            .collect();

        assert_eq!(starts, vec![t0, t0 + d, t0 + 2 * d]);
        assert_eq!(scheduler.next_start_time(), t0 + 3 * d);
        assert_eq!(output.scheduled().len(), 3);
    }

    #[test]
    fn test_monotonic_without_flush() {
        let (scheduler, output) = scheduler_at(Duration::ZERO);
        let mut previous: Option<PlaybackItem> = None;

        for (i, ms) in [20u64, 5, 75, 10, 40, 1].into_iter().enumerate() {
            // Let the clock run ahead of the cursor now and then
            if i % 2 == 1 {
                output.advance(Duration::from_millis(60));
            }
            let item = scheduler.enqueue(frame_ms(ms)).unwrap();
            if let Some(prev) = &previous {
                assert!(item.start_time >= prev.end_time());
            }
            previous = Some(item);
        }
    }

    #[test]
    fn test_late_frame_starts_at_clock() {
        let (scheduler, output) = scheduler_at(Duration::ZERO);
        scheduler.enqueue(frame_ms(10)).unwrap();
        output.advance(Duration::from_millis(50));

        let item = scheduler.enqueue(frame_ms(10)).unwrap();
        assert_eq!(item.start_time, Duration::from_millis(50));
    }

    #[test]
    fn test_completed_items_leave_in_flight_set() {
        let (scheduler, output) = scheduler_at(Duration::ZERO);
        scheduler.enqueue(frame_ms(10)).unwrap();
        scheduler.enqueue(frame_ms(10)).unwrap();
        assert_eq!(scheduler.in_flight_count(), 2);

        output.advance(Duration::from_millis(10));
        assert_eq!(scheduler.in_flight_count(), 1);
        output.advance(Duration::from_millis(10));
        assert_eq!(scheduler.in_flight_count(), 0);
    }

    #[test]
    fn test_flush_stops_and_resets_cursor() {
        let (scheduler, output) = scheduler_at(Duration::ZERO);
        let items: Vec<PlaybackItem> =
            (0..3).map(|_| scheduler.enqueue(frame_ms(100)).unwrap()).collect();

        output.advance(Duration::from_millis(130));
        let interrupted_at = output.now();
        assert_eq!(scheduler.flush(), 2);

        assert_eq!(scheduler.in_flight_count(), 0);
        assert_eq!(scheduler.next_start_time(), interrupted_at);
        assert_eq!(scheduler.generation(), 1);

        let mut stopped: Vec<u64> = output.stopped().into_iter().map(|(id, _)| id).collect();
        stopped.sort();
        assert_eq!(stopped, vec![items[1].id, items[2].id]);
        assert_eq!(output.completed(), vec![items[0].id]);

        let next = scheduler.enqueue(frame_ms(10)).unwrap();
        assert_eq!(next.start_time, interrupted_at);
        assert_eq!(next.generation, 1);
    }

    #[test]
    fn test_stale_generation_is_refused() {
        let (scheduler, output) = scheduler_at(Duration::ZERO);
        let generation = scheduler.generation();
        scheduler.flush();

        assert_eq!(scheduler.enqueue_for(generation, frame_ms(10)).unwrap(), None);
        assert!(output.scheduled().is_empty());

        let current = scheduler.generation();
        assert!(scheduler.enqueue_for(current, frame_ms(10)).unwrap().is_some());
    }

    #[test]
    fn test_device_failure_leaves_cursor() {
        let (scheduler, output) = scheduler_at(Duration::ZERO);
        scheduler.enqueue(frame_ms(10)).unwrap();
        output.fail_plays(DeviceError::Unavailable("unplugged".to_string()));

        let err = scheduler.enqueue(frame_ms(10)).unwrap_err();
        assert!(matches!(err, DeviceError::Unavailable(_)));
        assert_eq!(scheduler.next_start_time(), Duration::from_millis(10));
        assert_eq!(scheduler.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn test_close_releases_device() {
        let (scheduler, output) = scheduler_at(Duration::ZERO);
        scheduler.enqueue(frame_ms(10)).unwrap();
        scheduler.close().await.unwrap();

        assert!(output.is_closed());
        assert_eq!(scheduler.in_flight_count(), 0);
        assert_eq!(output.stopped().len(), 1);
    }
}
