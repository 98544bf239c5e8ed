//! Freshest-wins double buffering between capture and the mirror surface

use crate::frame::{BufferId, ReadyFrame};
use crate::importer::DisplaySubsystem;

/// The window surface frames are shown on.
pub trait PresentationSurface: DisplaySubsystem {
    /// True once the first configure handshake completed
    fn is_configured(&self) -> bool;

    fn attach(&mut self, buffer: &Self::Buffer);

    fn damage_all(&mut self);

    fn commit(&mut self);
}

/// Frames waiting to be shown, on screen, and replaced but not yet released.
#[derive(Debug)]
pub struct PresentationSlots<B> {
    pending: Option<ReadyFrame<B>>,
    displayed: Option<ReadyFrame<B>>,
    retired: Vec<ReadyFrame<B>>,
}

impl<B> Default for PresentationSlots<B> {
    fn default() -> Self {
        Self {
            pending: None,
            displayed: None,
            retired: Vec::new(),
        }
    }
}

impl<B> PresentationSlots<B> {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn pending(&self) -> Option<&ReadyFrame<B>> {
        self.pending.as_ref()
    }

    #[cfg(test)]
    pub fn displayed(&self) -> Option<&ReadyFrame<B>> {
        self.displayed.as_ref()
    }

    #[cfg(test)]
    pub fn retired(&self) -> usize {
        self.retired.len()
    }

    /// Install `frame` as the next frame to show.
    ///
    /// A frame still waiting in `pending` was never attached, so nothing will
    /// ever release it: it is freed right here. Returns its id.
    pub fn publish<D>(&mut self, frame: ReadyFrame<B>, display: &mut D) -> Option<BufferId>
    where
        D: DisplaySubsystem<Buffer = B>,
    {
        let stale = self.pending.replace(frame)?;
        let id = stale.id;
        tracing::debug!(buffer = id.0, "dropping undisplayed frame");
        stale.release(|buffer| display.destroy(buffer));
        Some(id)
    }

    /// Swap the pending frame onto the surface. Returns false if there was
    /// nothing new to show.
    pub fn present<S>(&mut self, surface: &mut S) -> bool
    where
        S: PresentationSurface<Buffer = B>,
    {
        let Some(next) = self.pending.take() else {
            return false;
        };

        // The compositor may still be reading the old buffer until it
        // sends release.
        if let Some(previous) = self.displayed.take() {
            self.retired.push(previous);
        }

        surface.attach(&next.buffer);
        surface.damage_all();
        surface.commit();
        tracing::trace!(buffer = next.id.0, "presented frame");

        self.displayed = Some(next);
        true
    }

    /// The display layer no longer needs buffer `id`.
    pub fn release<D>(&mut self, id: BufferId, display: &mut D) -> bool
    where
        D: DisplaySubsystem<Buffer = B>,
    {
        let frame = if let Some(pos) = self.retired.iter().position(|f| f.id == id) {
            Some(self.retired.swap_remove(pos))
        } else if self.displayed.as_ref().is_some_and(|f| f.id == id) {
            self.displayed.take()
        } else if self.pending.as_ref().is_some_and(|f| f.id == id) {
            self.pending.take()
        } else {
            None
        };

        match frame {
            Some(frame) => {
                frame.release(|buffer| display.destroy(buffer));
                true
            }
            None => {
                tracing::debug!(buffer = id.0, "release for unknown buffer");
                false
            }
        }
    }

    /// Free every frame in every slot.
    pub fn release_all<D>(&mut self, display: &mut D) -> usize
    where
        D: DisplaySubsystem<Buffer = B>,
    {
        let frames: Vec<_> = self
            .pending
            .take()
            .into_iter()
            .chain(self.displayed.take())
            .chain(self.retired.drain(..))
            .collect();
        let count = frames.len();
        for frame in frames {
            frame.release(|buffer| display.destroy(buffer));
        }
        count
    }
}
