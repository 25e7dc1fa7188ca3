//! Injector sinks and coordinate scaling

use std::collections::HashSet;

use tracing::trace;

use super::{InputError, InputEvent};

/// Backend that replays input on the host's OS
pub trait InputInjector: Send {
    fn inject(&mut self, event: InputEvent) -> Result<(), InputError>;
}

/// In-process injector backend
///
/// Tracks pointer position, held keys and buttons. Used when no OS backend is
/// plugged in and by the injection self-test.
#[derive(Debug, Default)]
pub struct VirtualInjector {
    pointer: (u32, u32),
    keys_down: HashSet<u32>,
    buttons_down: HashSet<u8>,
    injected: u64,
}

impl VirtualInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pointer(&self) -> (u32, u32) {
        self.pointer
    }

    pub fn is_key_down(&self, keycode: u32) -> bool {
        self.keys_down.contains(&keycode)
    }

    pub fn is_button_down(&self, button: u8) -> bool {
        self.buttons_down.contains(&button)
    }

    pub fn injected(&self) -> u64 {
        self.injected
    }
}

impl InputInjector for VirtualInjector {
    fn inject(&mut self, event: InputEvent) -> Result<(), InputError> {
        match event {
            InputEvent::MouseMove { x, y } => self.pointer = (x, y),
            InputEvent::MouseButton { button, pressed } => {
                if pressed {
                    self.buttons_down.insert(button);
                } else {
                    self.buttons_down.remove(&button);
                }
            }
            InputEvent::Key { keycode, pressed } => {
                if pressed {
                    self.keys_down.insert(keycode);
                } else {
                    self.keys_down.remove(&keycode);
                }
            }
            InputEvent::Scroll { dx, dy } => {
                if !dx.is_finite() || !dy.is_finite() {
                    return Err(InputError::InjectionFailed(
                        "non-finite scroll delta".to_string(),
                    ));
                }
            }
        }
        self.injected += 1;
        trace!("Injected {:?}", event);
        Ok(())
    }
}

/// Injector wrapper that maps pointer coordinates from the sender's source
/// resolution into the injector's configured resolution
pub struct ScaledInjector {
    width: u32,
    height: u32,
    inner: Box<dyn InputInjector>,
}

impl ScaledInjector {
    pub fn new(width: u32, height: u32, inner: Box<dyn InputInjector>) -> Result<Self, InputError> {
        if width == 0 || height == 0 {
            return Err(InputError::InvalidResolution { width, height });
        }
        Ok(Self {
            width,
            height,
            inner,
        })
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Inject an event whose coordinates are expressed in `source` pixels
    pub fn inject_from(
        &mut self,
        event: InputEvent,
        source_width: u32,
        source_height: u32,
    ) -> Result<(), InputError> {
        let event = match event {
            InputEvent::MouseMove { x, y } => InputEvent::MouseMove {
                x: scale_axis(x, source_width, self.width),
                y: scale_axis(y, source_height, self.height),
            },
            other => other,
        };
        self.inner.inject(event)
    }

    /// Move the pointer to the centre of the injector's resolution
    pub fn inject_test_event(&mut self) -> Result<(), InputError> {
        let centre = InputEvent::MouseMove {
            x: self.width / 2,
            y: self.height / 2,
        };
        self.inner.inject(centre)
    }
}

fn scale_axis(value: u32, source: u32, target: u32) -> u32 {
    if source == 0 || source == target {
        return value.min(target.saturating_sub(1));
    }
    let scaled = (value as u64 * target as u64) / source as u64;
    (scaled as u32).min(target.saturating_sub(1))
}

/// Drops input messages that arrive out of order
///
/// Each peer numbers its events; anything not newer than the last applied
/// event is stale and discarded.
#[derive(Debug, Default)]
pub struct InputOrdering {
    last_applied: Option<u64>,
    dropped: u64,
}

impl InputOrdering {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the message with `seq` should be applied
    pub fn accept(&mut self, seq: u64) -> bool {
        match self.last_applied {
            Some(last) if seq <= last => {
                self.dropped += 1;
                false
            }
            _ => {
                self.last_applied = Some(seq);
                true
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    struct Recording(Arc<Mutex<Vec<InputEvent>>>);

    impl InputInjector for Recording {
        fn inject(&mut self, event: InputEvent) -> Result<(), InputError> {
            self.0.lock().push(event);
            Ok(())
        }
    }

    #[test]
    fn test_scaling_to_smaller_display() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut injector =
            ScaledInjector::new(1280, 720, Box::new(Recording(events.clone()))).unwrap();

        injector
            .inject_from(InputEvent::MouseMove { x: 960, y: 540 }, 1920, 1080)
            .unwrap();

        assert_eq!(events.lock()[0], InputEvent::MouseMove { x: 640, y: 360 });
    }

    #[test]
    fn test_scaling_clamps_to_bounds() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut injector =
            ScaledInjector::new(800, 600, Box::new(Recording(events.clone()))).unwrap();

        injector
            .inject_from(InputEvent::MouseMove { x: 5000, y: 5000 }, 800, 600)
            .unwrap();

        assert_eq!(events.lock()[0], InputEvent::MouseMove { x: 799, y: 599 });
    }

    #[test]
    fn test_non_pointer_events_pass_through() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut injector =
            ScaledInjector::new(800, 600, Box::new(Recording(events.clone()))).unwrap();
        let key = InputEvent::Key {
            keycode: 30,
            pressed: true,
        };

        injector.inject_from(key, 1920, 1080).unwrap();
        assert_eq!(events.lock()[0], key);
    }

    #[test]
    fn test_zero_resolution_rejected() {
        let result = ScaledInjector::new(0, 600, Box::new(VirtualInjector::new()));
        assert!(matches!(
            result,
            Err(InputError::InvalidResolution { width: 0, .. })
        ));
    }

    #[test]
    fn test_virtual_injector_tracks_state() {
        let mut injector = VirtualInjector::new();
        injector
            .inject(InputEvent::Key {
                keycode: 42,
                pressed: true,
            })
            .unwrap();
        injector
            .inject(InputEvent::MouseButton {
                button: 1,
                pressed: true,
            })
            .unwrap();
        injector.inject(InputEvent::MouseMove { x: 10, y: 20 }).unwrap();

        assert!(injector.is_key_down(42));
        assert!(injector.is_button_down(1));
        assert_eq!(injector.pointer(), (10, 20));
        assert_eq!(injector.injected(), 3);
    }

    #[test]
    fn test_ordering_drops_stale() {
        let mut ordering = InputOrdering::new();
        assert!(ordering.accept(1));
        assert!(ordering.accept(3));
        assert!(!ordering.accept(2));
        assert!(!ordering.accept(3));
        assert!(ordering.accept(4));
        assert_eq!(ordering.dropped(), 2);
    }
}
