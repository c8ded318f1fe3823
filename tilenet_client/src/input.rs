//! Input handling.
//!
//! Sampled button state becomes a movement intent, sent to the server once
//! per client tick as a `PlayerInput` extension message.

use tilenet_shared::{builtin::PlayerInput, math::Vec2};

/// User input state at a moment in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputState {
    pub left: bool,
    pub right: bool,
    pub jump: bool,
}

impl InputState {
    /// Horizontal axis from left/right; negative y requests a jump.
    pub fn intent(self) -> Vec2 {
        let x = (self.right as i8 - self.left as i8) as f32;
        let y = if self.jump { -1.0 } else { 0.0 };
        Vec2::new(x, y)
    }
}

/// Turns sampled input into a `PlayerInput` for a tick.
pub fn build_input(tick: u32, input: InputState) -> PlayerInput {
    PlayerInput {
        tick,
        intent: input.intent(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opposing_directions_cancel() {
        let both = InputState {
            left: true,
            right: true,
            jump: false,
        };
        assert_eq!(both.intent(), Vec2::ZERO);

        let jump_left = InputState {
            left: true,
            right: false,
            jump: true,
        };
        assert_eq!(build_input(7, jump_left).intent, Vec2::new(-1.0, -1.0));
    }
}
