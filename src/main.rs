// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result, bail};
use smithay::utils::{Logical, Physical, Point, Rectangle, Size, Transform};
use std::{
    sync::{Arc, mpsc},
    time::Duration,
};
use swl_kms::{
    AssignPlaneFlags, BufferLayout, CallbackContext, Crtc, CrtcLayout, DeviceSelection, FlipTimings,
    Kms, KmsConfig, KmsError, Mode, PageFlipListener, ScanoutBuffer, Update, UpdateFlags,
    kernel::mock::{ARGB8888, MockKernel, MockResources, XRGB8888},
};
use tracing::{error, info, warn};

const FRAME_TIMEOUT: Duration = Duration::from_secs(1);

fn main() {
    if let Err(err) = main_inner() {
        error!("Error occurred in main(): {:#}", err);
        std::process::exit(1);
    }
}

fn main_inner() -> Result<()> {
    init_logger()?;
    info!("swl-kms starting up!");

    let config = KmsConfig::from_env().context("Failed to read configuration")?;
    let mut kms = Kms::new(config.thread)?;

    match &config.device {
        DeviceSelection::Mock => {
            let mock = MockKernel::new(MockResources::dual_output().build(), true);
            kms.add_device("mock", Box::new(mock.clone()), config.mode)?;
            run_frames(&kms, &mock, config.frames)?;
        }
        DeviceSelection::Path(path) => {
            kms.open(path, config.mode)?;
            validate_outputs(&kms)?;
        }
        DeviceSelection::Auto => {
            kms.open_primary_gpu(config.mode)?;
            validate_outputs(&kms)?;
        }
    }

    kms.prepare_shutdown()?;
    info!("Done");
    Ok(())
}

fn init_logger() -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("swl_kms=info"));

    fmt().with_env_filter(filter).init();

    Ok(())
}

/// Check that every connected output accepts its preferred mode, without
/// touching what is on screen
fn validate_outputs(kms: &Kms) -> Result<()> {
    for device in kms.devices() {
        for (connector, crtc) in device.display_configuration() {
            let Some(mode) = connector.preferred_mode().cloned() else {
                warn!(connector = connector.name(), "Connector has no modes");
                continue;
            };
            let mut update = Update::new();
            update.mode_set(&crtc, &[connector.clone()], Some(mode.clone()));
            let feedback = kms.test_update(update);
            match feedback.error() {
                None => info!(connector = connector.name(), %crtc, ?mode, "Mode set would pass"),
                Some(err) => {
                    warn!(connector = connector.name(), %crtc, %err, "Mode set would fail")
                }
            }
        }
    }
    Ok(())
}

enum FrameEvent {
    Presented(FlipTimings),
    Immediate,
    Failed(Option<KmsError>),
}

struct FrameListener(mpsc::Sender<FrameEvent>);

impl PageFlipListener for FrameListener {
    fn flipped(&self, _crtc: &Crtc, timings: FlipTimings) {
        let _ = self.0.send(FrameEvent::Presented(timings));
    }

    fn ready(&self, _crtc: &Crtc) {
        let _ = self.0.send(FrameEvent::Immediate);
    }

    fn mode_set_fallback(&self, _crtc: &Crtc) {
        let _ = self.0.send(FrameEvent::Immediate);
    }

    fn discarded(&self, _crtc: &Crtc, error: Option<&KmsError>) {
        let _ = self.0.send(FrameEvent::Failed(error.cloned()));
    }
}

fn mode_rects(mode: &Mode) -> (Rectangle<f64, smithay::utils::Buffer>, Rectangle<i32, Physical>) {
    let (w, h) = mode.size();
    (
        Rectangle::new(Point::from((0.0, 0.0)), Size::from((w as f64, h as f64))),
        Rectangle::new(Point::from((0, 0)), Size::from((w as i32, h as i32))),
    )
}

/// Flip between two buffers on the first output of the in-memory device,
/// with the cursor circling around the middle of the screen
fn run_frames(kms: &Kms, mock: &MockKernel, frames: u32) -> Result<()> {
    let device = kms.devices().next().context("No device")?.clone();
    let (connector, crtc) = device
        .display_configuration()
        .into_iter()
        .next()
        .context("No connected output")?;
    let mode = connector
        .preferred_mode()
        .cloned()
        .context("Connector has no modes")?;
    let primary = device
        .primary_plane_for(&crtc)
        .cloned()
        .context("CRTC has no primary plane")?;
    let (w, h) = mode.size();
    let (w, h) = (u32::from(w), u32::from(h));
    info!(connector = connector.name(), %crtc, ?mode, frames, "Driving output");

    let buffers: Vec<Arc<ScanoutBuffer>> = (0..2)
        .map(|i| {
            let layout = BufferLayout::single_plane(w, h, w * 4, XRGB8888, 100 + i);
            kms.wrap_buffer(device.id(), layout)
        })
        .collect();

    let cursor = kms.cursor_manager();
    let area = Rectangle::<f64, Logical>::new(
        Point::from((0.0, 0.0)),
        Size::from((f64::from(w), f64::from(h))),
    );
    cursor.update_crtc_layout(vec![CrtcLayout {
        crtc: crtc.clone(),
        cursor_plane: device.cursor_plane_for(&crtc).cloned(),
        layout: area,
        scale: 1.0,
    }])?;
    let sprite = kms.wrap_buffer(
        device.id(),
        BufferLayout::single_plane(64, 64, 256, ARGB8888, 200),
    );
    cursor.update_sprite(&crtc, Some(sprite), Transform::Normal, None)?;

    let (tx, rx) = mpsc::channel();
    let listener = Arc::new(FrameListener(tx));
    let (src, dst) = mode_rects(&mode);

    for frame in 0..frames {
        let angle = f64::from(frame) / 10.0;
        cursor.position_changed(Point::from((
            area.size.w / 2.0 + angle.cos() * 200.0,
            area.size.h / 2.0 + angle.sin() * 200.0,
        )))?;

        let mut update = Update::new();
        if frame == 0 {
            update.mode_set(&crtc, &[connector.clone()], Some(mode.clone()));
        }
        let buffer = buffers[frame as usize % buffers.len()].clone();
        update.assign_plane(&crtc, &primary, buffer, src, dst, AssignPlaneFlags::empty());
        update.add_page_flip_listener(&crtc, listener.clone(), CallbackContext::MAIN);

        let feedback = kms.submit(update, UpdateFlags::empty());
        if let Some(err) = feedback.error() {
            bail!("Frame {frame} failed: {err}");
        }

        // vblank
        mock.complete_flips();
        kms.poll_events()?;
        kms.dispatch(Some(Duration::ZERO))?;
        match rx.recv_timeout(FRAME_TIMEOUT) {
            Ok(FrameEvent::Presented(timings)) => {
                info!(frame, sequence = timings.sequence, "Frame presented");
            }
            Ok(FrameEvent::Immediate) => info!(frame, "Frame applied without flip"),
            Ok(FrameEvent::Failed(err)) => bail!("Frame {frame} discarded: {err:?}"),
            Err(_) => bail!("Frame {frame} never completed"),
        }
    }

    kms.flush_callbacks();
    info!(
        framebuffers = mock.framebuffers_created(),
        live_blobs = mock.live_blobs(),
        "Finished"
    );
    Ok(())
}
