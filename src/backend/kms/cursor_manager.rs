// SPDX-License-Identifier: GPL-3.0-only

//! Hardware cursor planes.
//!
//! The cursor manager never builds commits on its own. It is an update filter:
//! right before an update reaches a device it adds, moves or removes the
//! cursor plane of the CRTC the update is for. Moving the pointer only marks
//! the affected CRTCs and schedules an otherwise empty update for them.
//!
//! Each CRTC keeps three buffer slots. `pending` was handed to the kernel
//! with a commit that has not been confirmed yet, `active` was accepted but
//! is not on screen yet, and `presenting` is being scanned out.

use smithay::utils::{Buffer, Logical, Physical, Point, Rectangle, Size, Transform};
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::{debug, trace, warn};

use super::{
    KmsImpl,
    buffer::ScanoutBuffer,
    error::{KmsError, KmsResult},
    impl_device::{FilterContext, UpdateFilter},
    page_flip::{FlipTimings, PageFlipListener},
    resources::{Crtc, Plane},
    thread::{CallbackContext, Callbacks, ThreadHandle},
    update::{AssignPlaneFlags, Update, UpdateFlags},
};

/// Where a CRTC sits in the global layout
#[derive(Debug, Clone)]
pub struct CrtcLayout {
    pub crtc: Arc<Crtc>,
    pub cursor_plane: Option<Arc<Plane>>,
    pub layout: Rectangle<f64, Logical>,
    pub scale: f64,
}

/// Returns the current pointer position; called from the impl context
pub type CursorQuery = Box<dyn Fn() -> Point<f64, Logical> + Send>;

type Slot = Option<Arc<ScanoutBuffer>>;

struct CrtcState {
    crtc: Arc<Crtc>,
    cursor_plane: Option<Arc<Plane>>,
    layout: Rectangle<f64, Logical>,
    scale: f64,
    transform: Transform,
    buffer: Slot,
    hotspot: Point<f64, Buffer>,

    cursor_invalidated: bool,
    force_update: bool,
    has_cursor: bool,

    pending: Slot,
    active: Slot,
    presenting: Slot,
}

type SharedCrtcState = Arc<Mutex<CrtcState>>;

fn lock(state: &SharedCrtcState) -> MutexGuard<'_, CrtcState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Move `from` into `to`. Whatever falls out of both slots is returned.
fn swap_slots(from: &mut Slot, to: &mut Slot) -> Slot {
    let same = match (&*from, &*to) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    };
    if same {
        from.take()
    } else {
        let released = to.take();
        *to = from.take();
        released
    }
}

impl CrtcState {
    fn new(layout: &CrtcLayout, buffer: Slot) -> Self {
        CrtcState {
            crtc: layout.crtc.clone(),
            cursor_plane: layout.cursor_plane.clone(),
            layout: layout.layout,
            scale: layout.scale,
            transform: Transform::Normal,
            buffer,
            hotspot: Point::default(),
            cursor_invalidated: true,
            force_update: false,
            has_cursor: false,
            pending: None,
            active: None,
            presenting: None,
        }
    }

    fn is_for(&self, crtc: &Crtc) -> bool {
        self.crtc.id() == crtc.id() && self.crtc.device() == crtc.device()
    }

    /// The cursor plane rectangle in CRTC coordinates, if any of it is visible
    fn cursor_rect(&self, position: Point<f64, Logical>) -> Option<Rectangle<f64, Physical>> {
        let buffer = self.buffer.as_ref()?;

        let crtc_pos: Point<i32, Physical> = Point::from((
            ((position.x - self.layout.loc.x) * self.scale) as i32,
            ((position.y - self.layout.loc.y) * self.scale) as i32,
        ));
        let crtc_size: Size<i32, Physical> = Size::from((
            (self.layout.size.w * self.scale).round() as i32,
            (self.layout.size.h * self.scale).round() as i32,
        ));
        let crtc_pos = self.transform.transform_point_in(crtc_pos, &crtc_size);
        let crtc_size = self.transform.transform_size(crtc_size);

        let rect = Rectangle::new(
            Point::from((
                crtc_pos.x as f64 - self.hotspot.x,
                crtc_pos.y as f64 - self.hotspot.y,
            )),
            Size::from((buffer.width() as f64, buffer.height() as f64)),
        );
        let visible = rect.loc.x + rect.size.w > 0.0
            && rect.loc.y + rect.size.h > 0.0
            && rect.loc.x < crtc_size.w as f64
            && rect.loc.y < crtc_size.h as f64;
        visible.then_some(rect)
    }

    fn take_buffers(&mut self) -> Vec<Arc<ScanoutBuffer>> {
        [
            self.buffer.take(),
            self.pending.take(),
            self.active.take(),
            self.presenting.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Promotes `active` to `presenting` once the commit hits the screen
struct CursorFlipListener {
    state: SharedCrtcState,
    callbacks: Callbacks,
}

impl CursorFlipListener {
    fn presented(&self) {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if let Some(buffer) = swap_slots(&mut state.active, &mut state.presenting) {
            self.callbacks.queue_release(CallbackContext::IMPL, buffer);
        }
    }
}

impl PageFlipListener for CursorFlipListener {
    fn flipped(&self, _crtc: &Crtc, _timings: FlipTimings) {
        self.presented();
    }

    fn ready(&self, _crtc: &Crtc) {}

    fn mode_set_fallback(&self, _crtc: &Crtc) {
        self.presented();
    }

    fn discarded(&self, _crtc: &Crtc, _error: Option<&KmsError>) {}
}

/// Impl-side cursor state, shared with the update filter it installs
pub(crate) struct CursorManagerImpl {
    callbacks: Callbacks,
    query: Option<CursorQuery>,
    last_position: Option<Point<f64, Logical>>,
    crtc_states: Vec<SharedCrtcState>,
}

impl fmt::Debug for CursorManagerImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorManagerImpl")
            .field("has_query", &self.query.is_some())
            .field("last_position", &self.last_position)
            .field("crtcs", &self.crtc_states.len())
            .finish()
    }
}

impl CursorManagerImpl {
    pub fn new(callbacks: Callbacks) -> Self {
        CursorManagerImpl {
            callbacks,
            query: None,
            last_position: None,
            crtc_states: Vec::new(),
        }
    }

    /// Wrap `manager` as an update filter
    pub fn filter(manager: Arc<Mutex<CursorManagerImpl>>) -> UpdateFilter {
        Box::new(move |ctx, update| {
            manager
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .filter_update(ctx, update);
        })
    }

    fn find(&self, crtc: &Crtc) -> Option<&SharedCrtcState> {
        self.crtc_states.iter().find(|state| lock(state).is_for(crtc))
    }

    fn current_position(&self) -> Option<Point<f64, Logical>> {
        match &self.query {
            Some(query) => Some(query()),
            None => self.last_position,
        }
    }

    fn release(&self, buffers: Vec<Arc<ScanoutBuffer>>) {
        if !buffers.is_empty() {
            self.callbacks.queue_release(CallbackContext::IMPL, buffers);
        }
    }

    pub fn set_query(&mut self, query: CursorQuery) {
        self.query = Some(query);
    }

    /// Record a new pointer position; returns the CRTCs whose cursor plane
    /// has to be updated
    pub fn position_changed(&mut self, position: Point<f64, Logical>) -> Vec<Arc<Crtc>> {
        self.last_position = Some(position);
        let mut scheduled = Vec::new();
        for state in &self.crtc_states {
            let mut state = lock(state);
            let should_have_cursor = state.cursor_rect(position).is_some();
            if should_have_cursor || state.has_cursor {
                state.cursor_invalidated = true;
                scheduled.push(state.crtc.clone());
            }
        }
        scheduled
    }

    /// Replace the sprite shown on `crtc`
    pub fn update_sprite(
        &mut self,
        crtc: &Crtc,
        buffer: Option<Arc<ScanoutBuffer>>,
        transform: Transform,
        hotspot: Point<f64, Buffer>,
    ) -> Option<Arc<Crtc>> {
        let Some(state) = self.find(crtc) else {
            warn!(crtc = crtc.id(), "Cursor sprite for a CRTC without layout");
            return None;
        };
        let mut state = lock(state);
        let old = std::mem::replace(&mut state.buffer, buffer);
        state.transform = transform;
        state.hotspot = hotspot;
        state.cursor_invalidated = true;
        let crtc = state.crtc.clone();
        drop(state);

        self.release(old.into_iter().collect());
        Some(crtc)
    }

    /// Replace the CRTC layout. Sprites of CRTCs present in both layouts
    /// are kept.
    pub fn update_crtc_layout(&mut self, layouts: &[CrtcLayout]) {
        let mut released = Vec::new();
        let mut old_states = std::mem::take(&mut self.crtc_states);

        for layout in layouts {
            let buffer = old_states
                .iter()
                .find_map(|state| {
                    let mut state = lock(state);
                    state.is_for(&layout.crtc).then(|| state.buffer.take())
                })
                .flatten();
            self.crtc_states
                .push(Arc::new(Mutex::new(CrtcState::new(layout, buffer))));
        }
        for state in old_states.drain(..) {
            released.extend(lock(&state).take_buffers());
        }
        debug!(crtcs = self.crtc_states.len(), "Updated cursor CRTC layout");
        self.release(released);
    }

    fn filter_update(&mut self, ctx: &FilterContext<'_>, update: &mut Update) {
        if ctx.flags.contains(UpdateFlags::TEST_ONLY) {
            return;
        }
        let Some(position) = self.current_position() else {
            return;
        };

        let mut old_buffers = Vec::new();
        if ctx.flags.contains(UpdateFlags::MODE_SET) {
            for state in &self.crtc_states {
                {
                    let mut state = lock(state);
                    if state.crtc.device() != ctx.device {
                        continue;
                    }
                    state.cursor_invalidated = true;
                    state.force_update = true;
                }
                self.maybe_update_cursor_plane(state, position, update, &mut old_buffers);
            }
        } else if let Some(crtc) = ctx.crtc {
            match self.find(crtc) {
                Some(state) => {
                    self.maybe_update_cursor_plane(state, position, update, &mut old_buffers)
                }
                None => trace!(crtc = crtc.id(), "No cursor state for CRTC"),
            }
        }
        self.release(old_buffers);
    }

    fn maybe_update_cursor_plane(
        &self,
        shared: &SharedCrtcState,
        position: Point<f64, Logical>,
        update: &mut Update,
        old_buffers: &mut Vec<Arc<ScanoutBuffer>>,
    ) {
        let mut guard = lock(shared);
        let state = &mut *guard;
        let Some(cursor_plane) = state.cursor_plane.clone() else {
            return;
        };
        if !state.cursor_invalidated {
            return;
        }

        let rect = state.cursor_rect(position);
        let did_have_cursor = state.has_cursor;
        state.has_cursor = rect.is_some();
        if rect.is_none() && !did_have_cursor {
            return;
        }

        let crtc = state.crtc.clone();
        match (rect, state.buffer.clone()) {
            (Some(rect), Some(buffer)) => {
                let unchanged = state
                    .pending
                    .as_ref()
                    .is_some_and(|pending| Arc::ptr_eq(pending, &buffer));
                let mut flags = AssignPlaneFlags::empty();
                if !unchanged {
                    old_buffers.extend(state.pending.replace(buffer.clone()));
                } else if !state.force_update {
                    flags |= AssignPlaneFlags::FB_UNCHANGED;
                }

                let src = Rectangle::new(
                    Point::from((0.0, 0.0)),
                    Size::from((buffer.width() as f64, buffer.height() as f64)),
                );
                let dst = Rectangle::new(
                    Point::from((rect.loc.x.round() as i32, rect.loc.y.round() as i32)),
                    Size::from((rect.size.w.round() as i32, rect.size.h.round() as i32)),
                );
                trace!(crtc = crtc.id(), ?dst, "Placing cursor");
                let assignment = update.assign_plane(&crtc, &cursor_plane, buffer, src, dst, flags);
                if cursor_plane.supports_cursor_hotspot() {
                    assignment.set_cursor_hotspot(Point::from((
                        state.hotspot.x.round() as i32,
                        state.hotspot.y.round() as i32,
                    )));
                }
            }
            _ => {
                trace!(crtc = crtc.id(), "Hiding cursor");
                old_buffers.extend(state.pending.take());
                update.unassign_plane(&crtc, &cursor_plane);
            }
        }
        state.force_update = false;
        drop(guard);

        update.add_page_flip_listener(
            &crtc,
            Arc::new(CursorFlipListener {
                state: shared.clone(),
                callbacks: self.callbacks.clone(),
            }),
            CallbackContext::MAIN,
        );
        let state = shared.clone();
        let callbacks = self.callbacks.clone();
        update.add_result_listener(CallbackContext::MAIN, move |feedback| {
            if !feedback.is_passed() {
                return;
            }
            let mut guard = lock(&state);
            let state = &mut *guard;
            state.cursor_invalidated = false;
            if let Some(buffer) = swap_slots(&mut state.pending, &mut state.active) {
                callbacks.queue_release(CallbackContext::IMPL, buffer);
            }
        });
    }

    /// Drop every CRTC state, handing all buffers back for release
    pub fn clear(&mut self) {
        let released: Vec<_> = self
            .crtc_states
            .drain(..)
            .flat_map(|state| lock(&state).take_buffers())
            .collect();
        self.release(released);
    }

    #[cfg(test)]
    fn slots(&self, crtc: &Crtc) -> [Option<Arc<ScanoutBuffer>>; 3] {
        let state = self.find(crtc).map(lock);
        state.map_or([None, None, None], |state| {
            [
                state.pending.clone(),
                state.active.clone(),
                state.presenting.clone(),
            ]
        })
    }
}

/// Caller-side handle. Every call is posted to the impl context and takes
/// effect asynchronously.
#[derive(Clone)]
pub struct CursorManager {
    thread: ThreadHandle<KmsImpl>,
}

impl fmt::Debug for CursorManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorManager").finish_non_exhaustive()
    }
}

impl CursorManager {
    pub(crate) fn new(thread: ThreadHandle<KmsImpl>) -> Self {
        CursorManager { thread }
    }

    /// Install the function used to read the pointer position right before
    /// a commit. Without one the last reported position is used.
    pub fn set_query_func(
        &self,
        func: impl Fn() -> Point<f64, Logical> + Send + 'static,
    ) -> KmsResult<()> {
        let func: CursorQuery = Box::new(func);
        self.thread.post(move |kms| kms.cursor_manager().set_query(func))
    }

    pub fn position_changed(&self, position: Point<f64, Logical>) -> KmsResult<()> {
        self.thread.post(move |kms| {
            let crtcs = kms.cursor_manager().position_changed(position);
            for crtc in crtcs {
                kms.schedule_process(crtc);
            }
        })
    }

    /// Show `buffer` as the cursor of `crtc`, or hide it with `None`
    pub fn update_sprite(
        &self,
        crtc: &Arc<Crtc>,
        buffer: Option<Arc<ScanoutBuffer>>,
        transform: Transform,
        hotspot: Option<Point<f64, Buffer>>,
    ) -> KmsResult<()> {
        let crtc = crtc.clone();
        self.thread.post(move |kms| {
            let hotspot = hotspot.unwrap_or_default();
            let changed = kms
                .cursor_manager()
                .update_sprite(&crtc, buffer, transform, hotspot);
            if let Some(crtc) = changed {
                kms.schedule_process(crtc);
            }
        })
    }

    pub fn update_crtc_layout(&self, layouts: Vec<CrtcLayout>) -> KmsResult<()> {
        self.thread
            .post(move |kms| kms.cursor_manager().update_crtc_layout(&layouts))
    }
}
