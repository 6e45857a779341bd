//! Camera and file source stage.

use super::collaborators::FrameCapture;
use super::{accept_number, publish_number, publish_selection};
use crate::backend::{StageError, StageWorker, WorkerContext};
use crate::control::{FieldChange, FieldValue, NumberConfig, SelectionConfig, SheetBuilder};
use crate::pipeline::{Envelope, ReemitListener};
use crate::types::FRAME_KEY;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEVICE_NONE_CHOICE: &str = "No device";

/// Persisted source settings. `None` means "never touched".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceState {
    /// Defaults to none for cameras and the first entry for files.
    pub device: Option<usize>,
    /// Defaults to 0 (as fast as the device delivers).
    pub target_fps: Option<f64>,
}

pub struct SourceWorker {
    capture: Box<dyn FrameCapture>,
    default_first_device: bool,
    opened: Option<usize>,
    reemit: Option<ReemitListener>,
    last: Option<(Envelope, Arc<[u8]>)>,
    last_capture: Option<Instant>,
}

impl SourceWorker {
    /// Opens nothing until a device is picked.
    pub fn camera(capture: Box<dyn FrameCapture>) -> Self {
        Self::new(capture, false)
    }

    /// Opens the first file unless told otherwise.
    pub fn file(capture: Box<dyn FrameCapture>) -> Self {
        Self::new(capture, true)
    }

    fn new(capture: Box<dyn FrameCapture>, default_first_device: bool) -> Self {
        Self {
            capture,
            default_first_device,
            opened: None,
            reemit: None,
            last: None,
            last_capture: None,
        }
    }

    fn open_device(
        &mut self,
        ctx: &mut WorkerContext<SourceState>,
        device: Option<usize>,
    ) -> Result<(), StageError> {
        if self.opened.is_some() {
            self.capture.close();
            self.opened = None;
        }
        self.last = None;
        let Some(device) = device else {
            return Ok(());
        };
        self.capture.open(device)?;
        tracing::info!("{}: opened device #{}", ctx.name(), device);
        self.opened = Some(device);
        ctx.clear_error();
        Ok(())
    }

    /// Re-push the last frame under a new uid.
    fn replay(&mut self, ctx: &mut WorkerContext<SourceState>) -> Result<(), StageError> {
        let Some((last, image)) = &self.last else {
            return Ok(());
        };
        let mut env = last.replay();
        env.assign_weak_heap(ctx.heap());
        env.set_image(FRAME_KEY, image.clone())?;
        tracing::debug!("{}: replaying frame {}", ctx.name(), env.frame_num);
        ctx.emit(env);
        Ok(())
    }

    fn frame_interval(ctx: &WorkerContext<SourceState>) -> Option<Duration> {
        let fps = ctx.state().target_fps.unwrap_or(0.0);
        (fps > 0.0).then(|| Duration::from_secs_f64(1.0 / fps))
    }
}

impl StageWorker for SourceWorker {
    type State = SourceState;

    fn declare_controls(builder: &mut SheetBuilder) {
        builder
            .selection(
                "device",
                SelectionConfig::default().with_none_choice(DEVICE_NONE_CHOICE),
            )
            .number("target_fps", NumberConfig::int(0, 240));
    }

    fn on_start(&mut self, ctx: &mut WorkerContext<SourceState>) -> Result<(), StageError> {
        self.reemit = Some(ctx.reemit_signal().listener());

        let devices = self.capture.devices();
        let wanted = ctx
            .state()
            .device
            .or_else(|| self.default_first_device.then_some(0));
        let device = publish_selection(
            ctx.sheet(),
            "device",
            &devices,
            Some(DEVICE_NONE_CHOICE),
            wanted,
        )?;
        let fps = publish_number(ctx.sheet(), "target_fps", ctx.state().target_fps.unwrap_or(0.0))?;
        ctx.state_mut().target_fps = Some(fps);

        // A device that fails to open is an error on the sheet, not a failed start.
        if let Err(e) = self.open_device(ctx, device) {
            ctx.report_error(e);
        }
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext<SourceState>) -> Result<(), StageError> {
        if !ctx.flush_output() {
            return Ok(());
        }
        if self.reemit.as_mut().is_some_and(ReemitListener::recv) && self.last.is_some() {
            return self.replay(ctx);
        }
        if self.opened.is_none() {
            std::thread::sleep(ctx.timing().idle_sleep);
            return Ok(());
        }
        if let (Some(interval), Some(last)) = (Self::frame_interval(ctx), self.last_capture) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep((interval - elapsed).min(ctx.timing().read_timeout));
                return Ok(());
            }
        }

        let Some(frame) = self.capture.capture()? else {
            std::thread::sleep(ctx.timing().read_timeout);
            return Ok(());
        };
        self.last_capture = Some(Instant::now());

        let mut env = ctx.new_envelope(frame.frame_num, frame.timestamp);
        env.frame_size = Some(frame.size);
        env.set_image(FRAME_KEY, frame.image.clone())?;
        self.last = Some((env.detached(), frame.image));
        ctx.emit(env);
        Ok(())
    }

    fn on_stop(&mut self, ctx: &mut WorkerContext<SourceState>) {
        if self.opened.take().is_some() {
            self.capture.close();
            tracing::info!("{}: closed device", ctx.name());
        }
        self.last = None;
        self.last_capture = None;
        self.reemit = None;
    }

    fn on_control(
        &mut self,
        ctx: &mut WorkerContext<SourceState>,
        change: &FieldChange,
    ) -> Result<(), StageError> {
        match change.field.as_str() {
            "device" => {
                let Some(device) = change.value().and_then(FieldValue::as_selection) else {
                    return Ok(());
                };
                ctx.state_mut().device = device;
                ctx.save_state();
                self.open_device(ctx, device)?;
            }
            "target_fps" => {
                if let Some(fps) = accept_number(ctx.sheet(), change)? {
                    ctx.state_mut().target_fps = Some(fps);
                    ctx.save_state();
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageKind;
    use crate::stages::collaborators::{CapturedFrame, MockFrameCapture};
    use crate::stages::test_support::Harness;
    use crate::types::FrameSize;

    fn mock_capture(frames: u64) -> MockFrameCapture {
        let mut cap = MockFrameCapture::new();
        cap.expect_devices()
            .returning(|| vec!["cam0".to_string(), "cam1".to_string()]);
        cap.expect_open().returning(|_| Ok(()));
        cap.expect_close().returning(|| ());
        let mut n = 0;
        cap.expect_capture().returning(move || {
            if n >= frames {
                return Ok(None);
            }
            n += 1;
            Ok(Some(CapturedFrame {
                image: Arc::from(vec![n as u8; 4]),
                size: FrameSize::new(2, 2, 1),
                frame_num: n,
                timestamp: n as f64 / 30.0,
            }))
        });
        cap
    }

    #[test]
    fn test_camera_opens_nothing_by_default() {
        let mut cap = MockFrameCapture::new();
        cap.expect_devices().returning(|| vec!["cam0".to_string()]);
        cap.expect_open().never();
        cap.expect_capture().never();
        let mut h = Harness::new(StageKind::CameraSource, SourceWorker::camera(Box::new(cap)));
        h.start();
        h.tick();
        assert!(h.take_output().is_none());
        let device = h.host.selection("device").unwrap();
        assert_eq!(device.get_choices(), vec!["cam0".to_string()]);
        assert_eq!(device.get_selected_index(), None);
    }

    #[test]
    fn test_emits_frames_with_image() {
        let mut h = Harness::new(
            StageKind::FileSource,
            SourceWorker::file(Box::new(mock_capture(2))),
        );
        h.start();
        h.tick();
        let env = h.take_output().unwrap();
        assert_eq!(env.frame_num, 1);
        assert_eq!(env.frame_size, Some(FrameSize::new(2, 2, 1)));
        assert_eq!(&env.get_image(FRAME_KEY).unwrap().unwrap()[..], &[1, 1, 1, 1]);
        assert_eq!(h.host.selection("device").unwrap().get_selected_index(), Some(0));
    }

    #[test]
    fn test_reemit_replays_last_frame() {
        let mut h = Harness::new(
            StageKind::FileSource,
            SourceWorker::file(Box::new(mock_capture(1))),
        );
        h.start();
        h.tick();
        let first = h.take_output().unwrap();

        // No new capture available; only the reemit produces output.
        h.tick();
        assert!(h.take_output().is_none());

        h.reemit.send();
        h.tick();
        let replay = h.take_output().unwrap();
        assert_eq!(replay.frame_num, first.frame_num);
        assert_ne!(replay.uid(), first.uid());
        assert_eq!(
            replay.get_image(FRAME_KEY).unwrap(),
            first.get_image(FRAME_KEY).unwrap()
        );
    }

    #[test]
    fn test_device_open_failure_is_reported() {
        let mut cap = MockFrameCapture::new();
        cap.expect_devices().returning(|| vec!["broken".to_string()]);
        cap.expect_open()
            .returning(|_| Err(StageError::Device("busy".into())));
        let mut h = Harness::new(StageKind::FileSource, SourceWorker::file(Box::new(cap)));
        h.start();
        assert!(h.error().unwrap().contains("busy"));
    }

    #[test]
    fn test_target_fps_clamped_and_saved() {
        let mut h = Harness::new(
            StageKind::FileSource,
            SourceWorker::file(Box::new(mock_capture(0))),
        );
        h.start();
        h.control("target_fps", FieldValue::Number(1000.0));
        assert_eq!(h.ctx.state().target_fps, Some(240.0));
        assert_eq!(h.host.number("target_fps").unwrap().get_number(), 240.0);
    }
}
