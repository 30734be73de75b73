//! External display surfaces
//!
//! Notification text, home-screen widgets and UI subscribers are pure
//! consumers of `(steps, paused)` snapshots. Publishing is fire-and-forget:
//! a lost publish is repaired by the next refresh.

use crate::config::{DistanceUnit, EngineConfig};
use crate::types::{CalendarDay, StepSnapshot};
use serde::{Deserialize, Serialize};
use crossbeam::channel::Sender;
use std::sync::Arc;

/// Stride length as a fraction of body height
const STRIDE_HEIGHT_RATIO: f64 = 0.41;
const KM_TO_MILES: f64 = 0.621371;

pub trait ExternalSurfaces: Send + Sync {
    fn publish(&self, snapshot: &StepSnapshot);

    /// Called once per day when the daily goal is first reached
    fn goal_reached(&self, _day: CalendarDay, _target: u32) {}
}

/// Fans every publish out to a set of surfaces
#[derive(Default, Clone)]
pub struct SurfaceHub {
    surfaces: Vec<Arc<dyn ExternalSurfaces>>,
}

impl SurfaceHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, surface: Arc<dyn ExternalSurfaces>) -> Self {
        self.surfaces.push(surface);
        self
    }

    pub fn add(&mut self, surface: Arc<dyn ExternalSurfaces>) {
        self.surfaces.push(surface);
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }
}

impl ExternalSurfaces for SurfaceHub {
    fn publish(&self, snapshot: &StepSnapshot) {
        for surface in &self.surfaces {
            surface.publish(snapshot);
        }
    }

    fn goal_reached(&self, day: CalendarDay, target: u32) {
        for surface in &self.surfaces {
            surface.goal_reached(day, target);
        }
    }
}

/// Formats the persistent notification line
#[derive(Debug, Clone, Copy)]
pub struct NotificationRenderer {
    height_cm: u32,
    unit: DistanceUnit,
}

impl NotificationRenderer {
    pub fn new(height_cm: u32, unit: DistanceUnit) -> Self {
        Self { height_cm, unit }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.height_cm, config.distance_unit)
    }

    /// Estimated distance walked, in the configured unit
    pub fn distance(&self, steps: u32) -> f64 {
        let km = f64::from(steps) * f64::from(self.height_cm) * STRIDE_HEIGHT_RATIO / 100_000.0;
        match self.unit {
            DistanceUnit::Metric => km,
            DistanceUnit::Imperial => km * KM_TO_MILES,
        }
    }

    pub fn render(&self, snapshot: &StepSnapshot) -> String {
        if snapshot.paused {
            return format!("Step counting paused ({} steps today)", snapshot.steps);
        }
        format!(
            "{:.2} {} | {} steps",
            self.distance(snapshot.steps),
            self.unit.as_str(),
            snapshot.steps
        )
    }
}

/// Renders each snapshot and hands the text to a sink
pub struct NotificationSurface<F> {
    renderer: NotificationRenderer,
    sink: F,
}

impl<F> NotificationSurface<F>
where
    F: Fn(&str) + Send + Sync,
{
    pub fn new(renderer: NotificationRenderer, sink: F) -> Self {
        Self { renderer, sink }
    }
}

impl<F> ExternalSurfaces for NotificationSurface<F>
where
    F: Fn(&str) + Send + Sync,
{
    fn publish(&self, snapshot: &StepSnapshot) {
        (self.sink)(&self.renderer.render(snapshot));
    }

    fn goal_reached(&self, _day: CalendarDay, target: u32) {
        (self.sink)(&format!("Daily goal of {target} steps reached"));
    }
}

/// What a subscriber receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SurfaceEvent {
    Snapshot(StepSnapshot),
    GoalReached { day: CalendarDay, target: u32 },
}

/// Forwards snapshots to a channel receiver (UI subscriber)
pub struct ChannelSurface {
    sender: Sender<SurfaceEvent>,
}

impl ChannelSurface {
    pub fn new(sender: Sender<SurfaceEvent>) -> Self {
        Self { sender }
    }

    fn send(&self, event: SurfaceEvent) {
        if self.sender.send(event).is_err() {
            tracing::debug!("surface subscriber disconnected");
        }
    }
}

impl ExternalSurfaces for ChannelSurface {
    fn publish(&self, snapshot: &StepSnapshot) {
        self.send(SurfaceEvent::Snapshot(*snapshot));
    }

    fn goal_reached(&self, day: CalendarDay, target: u32) {
        self.send(SurfaceEvent::GoalReached { day, target });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use std::sync::Mutex;

    fn snapshot(steps: u32, paused: bool) -> StepSnapshot {
        StepSnapshot {
            day: CalendarDay::from_ymd(2024, 1, 15).unwrap(),
            steps,
            paused,
            goal_reached: false,
        }
    }

    #[test]
    fn test_distance_estimate() {
        let metric = NotificationRenderer::new(180, DistanceUnit::Metric);
        // 10000 * 180 * 0.41 / 100000 = 7.38 km
        assert!((metric.distance(10_000) - 7.38).abs() < 1e-9);
        let imperial = NotificationRenderer::new(180, DistanceUnit::Imperial);
        assert!((imperial.distance(10_000) - 7.38 * KM_TO_MILES).abs() < 1e-9);
    }

    #[test]
    fn test_render_text() {
        let renderer = NotificationRenderer::new(180, DistanceUnit::Metric);
        assert_eq!(renderer.render(&snapshot(10_000, false)), "7.38 km | 10000 steps");
        assert_eq!(
            renderer.render(&snapshot(12, true)),
            "Step counting paused (12 steps today)"
        );
    }

    #[test]
    fn test_hub_fans_out() {
        let (tx_a, rx_a) = channel::unbounded();
        let (tx_b, rx_b) = channel::unbounded();
        let hub = SurfaceHub::new()
            .with(Arc::new(ChannelSurface::new(tx_a)))
            .with(Arc::new(ChannelSurface::new(tx_b)));

        hub.publish(&snapshot(5, false));
        hub.goal_reached(CalendarDay::from_ymd(2024, 1, 15).unwrap(), 5);

        assert_eq!(rx_a.try_iter().count(), 2);
        let events: Vec<_> = rx_b.try_iter().collect();
        assert_eq!(events[0], SurfaceEvent::Snapshot(snapshot(5, false)));
        assert!(matches!(events[1], SurfaceEvent::GoalReached { target: 5, .. }));
    }

    #[test]
    fn test_notification_surface_uses_sink() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&lines);
        let surface = NotificationSurface::new(
            NotificationRenderer::new(100, DistanceUnit::Metric),
            move |text: &str| captured.lock().unwrap().push(text.to_string()),
        );
        surface.publish(&snapshot(1_000, false));
        assert_eq!(lines.lock().unwrap().as_slice(), ["0.41 km | 1000 steps"]);
    }

    #[test]
    fn test_channel_surface_shared_across_threads() {
        let (tx, rx) = channel::unbounded();
        let surface = Arc::new(ChannelSurface::new(tx));
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let surface = Arc::clone(&surface);
                std::thread::spawn(move || surface.publish(&snapshot(i, false)))
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(rx.try_iter().count(), 4);
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (tx, rx) = channel::unbounded();
        drop(rx);
        let surface = ChannelSurface::new(tx);
        surface.publish(&snapshot(1, false));
    }
}
