// SPDX-License-Identifier: GPL-2.0-or-later

// Frame scanner scheduling. Each registered scanner owns a single
// slot queue that the scheduler deposits into at the scanner's
// configured interval, newest frame wins. A worker task per scanner
// decodes, resizes and runs the detector, pushing into a single-slot
// result queue that the state machine drains once per tick.

mod convert;
mod detector;
mod frame;
mod motion;

pub use convert::{ConvertError, RgbImage, nv12_to_rgb, resize};
pub use detector::{Detector, PassthroughDetector, ScanKind, ScanResult};
pub use frame::Frame;
pub use motion::MotionDetector;

use common::{ArcMsgLogger, LogLevel, MsgLogger};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Frames between deposits for a requested scan rate, minimum one.
/// Rates above the camera output rate clamp to every frame.
#[allow(
    clippy::as_conversions,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
#[must_use]
pub fn scan_interval(camera_fps: f64, scan_fps: f64) -> u64 {
    if scan_fps <= 0.0 || camera_fps <= 0.0 {
        return 1;
    }
    ((camera_fps / scan_fps).round() as u64).max(1)
}

/// Scheduler side of one scanner.
pub struct SchedulerSlot {
    interval: u64,
    counter: u64,
    scan: Arc<AtomicBool>,
    queue_tx: watch::Sender<Option<Frame>>,
}

impl SchedulerSlot {
    /// Deposits the frame if the scanner is armed and due this frame.
    /// The queue holds one slot, the oldest frame is dropped on
    /// overwrite.
    pub fn on_frame(&mut self, frame: &Frame) {
        if !self.scan.load(Ordering::Relaxed) {
            self.counter = 0;
            return;
        }
        if self.counter % self.interval == 0 {
            self.counter = 0;
            self.queue_tx.send_replace(Some(frame.clone()));
        }
        self.counter += 1;
    }
}

/// Deposits one output frame into every registered slot in a fixed
/// order.
pub struct Scheduler {
    slots: Vec<SchedulerSlot>,
}

impl Scheduler {
    #[must_use]
    pub fn new(slots: Vec<SchedulerSlot>) -> Self {
        Self { slots }
    }

    pub fn on_frame(&mut self, frame: &Frame) {
        for slot in &mut self.slots {
            slot.on_frame(frame);
        }
    }
}

/// State machine side of one scanner: the arming flag and the result
/// queue.
pub struct ScannerCtl {
    name: String,
    kind: ScanKind,
    scan: Arc<AtomicBool>,
    result_rx: watch::Receiver<Option<ScanResult>>,
}

impl ScannerCtl {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> ScanKind {
        self.kind
    }

    pub fn set_scan(&self, armed: bool) {
        self.scan.store(armed, Ordering::Relaxed);
    }

    #[must_use]
    pub fn armed(&self) -> bool {
        self.scan.load(Ordering::Relaxed)
    }

    /// Drains at most one result, non-blocking.
    pub fn try_result(&mut self) -> Option<ScanResult> {
        if self.result_rx.has_changed().unwrap_or(false) {
            return self.result_rx.borrow_and_update().clone();
        }
        None
    }
}

/// Spawns the worker for one scanner and returns its two ends.
///
/// `broken_pipe_tx` is signalled when a frame fails to decode, which
/// means the raw pipe from the external decoder is out of sync.
pub fn new_scanner(
    token: CancellationToken,
    logger: ArcMsgLogger,
    detector: Box<dyn Detector>,
    camera_fps: f64,
    scan_fps: f64,
    broken_pipe_tx: mpsc::Sender<()>,
) -> (SchedulerSlot, ScannerCtl) {
    if scan_fps > camera_fps {
        logger.log(
            LogLevel::Warning,
            &format!(
                "{}: scan_fps {scan_fps} is above camera output fps {camera_fps}, clamping",
                detector.name(),
            ),
        );
    }
    let interval = scan_interval(camera_fps, scan_fps);

    let scan = Arc::new(AtomicBool::new(false));
    let (queue_tx, queue_rx) = watch::channel(None);
    let (result_tx, result_rx) = watch::channel(None);

    let slot = SchedulerSlot {
        interval,
        counter: 0,
        scan: scan.clone(),
        queue_tx,
    };
    let ctl = ScannerCtl {
        name: detector.name().to_owned(),
        kind: detector.kind(),
        scan: scan.clone(),
        result_rx,
    };

    tokio::spawn(async move {
        run_worker(token, logger, detector, scan, queue_rx, result_tx, broken_pipe_tx).await;
    });

    (slot, ctl)
}

async fn run_worker(
    token: CancellationToken,
    logger: ArcMsgLogger,
    mut detector: Box<dyn Detector>,
    scan: Arc<AtomicBool>,
    mut queue_rx: watch::Receiver<Option<Frame>>,
    result_tx: watch::Sender<Option<ScanResult>>,
    broken_pipe_tx: mpsc::Sender<()>,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            changed = queue_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
        let Some(frame) = queue_rx.borrow_and_update().clone() else {
            continue;
        };

        // A frame deposited before the scanner was disarmed is
        // discarded, this drains the pending queue once.
        if !scan.load(Ordering::Relaxed) {
            continue;
        }

        // Decode and inference are CPU bound.
        let result;
        (detector, result) = tokio::task::spawn_blocking(move || {
            let mut detector = detector;
            let (width, height) = detector.input_size();
            let result = frame
                .resized(width, height)
                .map(|resized| detector.infer(&resized));
            (detector, result)
        })
        .await
        .expect("join");

        match result {
            Ok(scan_result) => {
                result_tx.send_replace(Some(scan_result));
            }
            Err(e) => {
                logger.log(
                    LogLevel::Error,
                    &format!("unable to decode frame, pipe seems broken: {e}"),
                );
                _ = broken_pipe_tx.try_send(());
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::{DummyLogger, time::UnixNano};
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(5.0, 1.0, 5; "one_per_second")]
    #[test_case(5.0, 2.0, 3; "round_up")]
    #[test_case(5.0, 10.0, 1; "clamped")]
    #[test_case(0.0, 1.0, 1; "no_fps")]
    fn test_scan_interval(camera_fps: f64, scan_fps: f64, want: u64) {
        assert_eq!(want, scan_interval(camera_fps, scan_fps));
    }

    fn nv12_frame(time: i64) -> Frame {
        let mut raw = vec![128u8; 4 * 2];
        raw.extend(vec![128u8; 4]);
        Frame::new(Bytes::from(raw), 4, 2, UnixNano::new(time))
    }

    #[tokio::test]
    async fn test_worker_produces_result() {
        let token = CancellationToken::new();
        let (broken_tx, _broken_rx) = mpsc::channel(1);
        let (mut slot, mut ctl) = new_scanner(
            token.clone(),
            DummyLogger::new(),
            Box::new(PassthroughDetector::new(2, 2)),
            5.0,
            5.0,
            broken_tx,
        );

        assert!(ctl.try_result().is_none());
        ctl.set_scan(true);
        slot.on_frame(&nv12_frame(1));

        // Worker runs asynchronously.
        for _ in 0..100 {
            if let Some(result) = ctl.try_result() {
                assert_eq!(ScanResult::Passthrough, result);
                token.cancel();
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("no result produced");
    }

    #[tokio::test]
    async fn test_worker_flags_broken_pipe() {
        let token = CancellationToken::new();
        let (broken_tx, mut broken_rx) = mpsc::channel(1);
        let (mut slot, ctl) = new_scanner(
            token.clone(),
            DummyLogger::new(),
            Box::new(PassthroughDetector::new(2, 2)),
            5.0,
            5.0,
            broken_tx,
        );

        ctl.set_scan(true);
        // Truncated NV12 payload.
        let bad = Frame::new(Bytes::from_static(&[1, 2, 3]), 4, 2, UnixNano::new(0));
        slot.on_frame(&bad);

        broken_rx.recv().await.unwrap();
        token.cancel();
    }

    #[test]
    fn test_scheduler_slot_interval_and_arming() {
        let scan = Arc::new(AtomicBool::new(true));
        let (queue_tx, mut queue_rx) = watch::channel(None);
        let mut slot = SchedulerSlot {
            interval: 3,
            counter: 0,
            scan: scan.clone(),
            queue_tx,
        };

        let deposited = |rx: &mut watch::Receiver<Option<Frame>>| {
            let deposited = rx.has_changed().unwrap();
            if deposited {
                rx.borrow_and_update();
            }
            deposited
        };

        slot.on_frame(&nv12_frame(0));
        assert!(deposited(&mut queue_rx), "frame 0");
        slot.on_frame(&nv12_frame(1));
        assert!(!deposited(&mut queue_rx), "frame 1");
        slot.on_frame(&nv12_frame(2));
        assert!(!deposited(&mut queue_rx), "frame 2");
        slot.on_frame(&nv12_frame(3));
        assert!(deposited(&mut queue_rx), "frame 3");

        // Disarmed scanners reset their counter.
        scan.store(false, Ordering::Relaxed);
        slot.on_frame(&nv12_frame(4));
        assert!(!deposited(&mut queue_rx), "disarmed");
        scan.store(true, Ordering::Relaxed);
        slot.on_frame(&nv12_frame(5));
        assert!(deposited(&mut queue_rx), "re-armed deposits immediately");
    }

    #[test]
    fn test_scheduler_slot_drop_oldest() {
        let scan = Arc::new(AtomicBool::new(true));
        let (queue_tx, mut queue_rx) = watch::channel(None);
        let mut slot = SchedulerSlot {
            interval: 1,
            counter: 0,
            scan,
            queue_tx,
        };

        slot.on_frame(&nv12_frame(1));
        slot.on_frame(&nv12_frame(2));

        // Only the newest frame survives.
        let got = queue_rx.borrow_and_update().clone().unwrap();
        assert_eq!(UnixNano::new(2), got.time());
    }
}
