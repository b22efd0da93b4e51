//! ASCII wire protocol spoken by the soft-starter firmware.
//!
//! Every motor command is a short ASCII string. The soft-start ramp is six
//! `<pwm><letter>` tokens tagged `a` through `f`; the two fixed commands are
//! literal tokens:
//!
//! ```text
//! 50a,100b,150c,200d,250e,254f   - 6-step soft start
//! 0i                             - continuous (full speed) start
//! 0p                             - emergency stop
//! ```
//!
//! The Bluetooth link reports speed as a single binary byte offset by a
//! reserved marker ([`SPEED_MARKER`]). MQTT telemetry is plain text and is
//! parsed by the MQTT transport instead.
//!
//! All functions here are pure. Decoders never fail loudly: a malformed frame
//! yields `None` and the previous telemetry value stays in place.
//!
//! # Example
//!
//! ```rust
//! use rs_softstart::protocol::{encode_soft_start, validate_command, MotorCommand};
//!
//! let wire = encode_soft_start(&[50, 100, 150, 200, 250, 254]);
//! assert_eq!(wire, "50a,100b,150c,200d,250e,254f");
//! assert!(validate_command(&wire));
//!
//! let cmd = MotorCommand::soft_start([-5, 300, 10, 0, 254, 128]);
//! assert_eq!(cmd.encode(), "0a,254b,10c,0d,254e,128f");
//! ```

use core::fmt;

// ============================================================================
// Constants
// ============================================================================

/// Lowest PWM duty value accepted by the firmware.
pub const PWM_MIN: i32 = 0;

/// Highest PWM duty value accepted by the firmware.
pub const PWM_MAX: i32 = 254;

/// Number of steps in a soft-start ramp.
pub const STEP_COUNT: usize = 6;

/// Reserved marker byte added to the speed in Bluetooth telemetry frames.
pub const SPEED_MARKER: u8 = 0xD0;

/// Wire text for a continuous start.
pub const CONTINUOUS_COMMAND: &str = "0i";

/// Wire text for an emergency stop.
pub const STOP_COMMAND: &str = "0p";

/// Step letters, index 0 maps to `a`.
const STEP_LETTERS: [char; STEP_COUNT] = ['a', 'b', 'c', 'd', 'e', 'f'];

// ============================================================================
// Motor Command
// ============================================================================

/// A command understood by the soft-starter.
///
/// PWM values are stored already clamped, so a `MotorCommand` always
/// encodes to a valid wire string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MotorCommand {
    /// Ramp the motor up through six PWM duty steps.
    SoftStart6Step {
        /// Clamped PWM duty for each step, in order.
        values: [u8; STEP_COUNT],
    },
    /// Start at full speed without a ramp.
    ContinuousStart,
    /// Cut the motor immediately.
    EmergencyStop,
}

impl MotorCommand {
    /// Build a soft-start command, clamping each value into `[0, 254]`.
    pub fn soft_start(values: [i32; STEP_COUNT]) -> Self {
        MotorCommand::SoftStart6Step {
            values: values.map(clamp_pwm),
        }
    }

    /// Build a soft-start command from the first six values of a slice.
    ///
    /// Returns `None` when fewer than six values are supplied; a partial
    /// ramp is never sent.
    pub fn soft_start_from_slice(values: &[i32]) -> Option<Self> {
        let first: [i32; STEP_COUNT] = values.get(..STEP_COUNT)?.try_into().ok()?;
        Some(Self::soft_start(first))
    }

    /// Encode to the ASCII wire form.
    pub fn encode(&self) -> String {
        match self {
            MotorCommand::SoftStart6Step { values } => encode_soft_start(&values.map(i32::from)),
            MotorCommand::ContinuousStart => encode_continuous().to_string(),
            MotorCommand::EmergencyStop => encode_stop().to_string(),
        }
    }

    /// Label published alongside the command on the MQTT `type` topic and
    /// sent to the backend audit API.
    pub const fn type_label(&self) -> &'static str {
        match self {
            MotorCommand::SoftStart6Step { .. } => "arranque6p",
            MotorCommand::ContinuousStart => "continuo",
            MotorCommand::EmergencyStop => "paro",
        }
    }

    /// PWM values carried by the command (empty for the fixed commands).
    pub fn values(&self) -> Vec<u8> {
        match self {
            MotorCommand::SoftStart6Step { values } => values.to_vec(),
            _ => Vec::new(),
        }
    }

    /// Parse a wire string back into a command.
    ///
    /// Accepts `"0i"`, `"0p"`, or exactly six tokens tagged `a`..`f` in order.
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            CONTINUOUS_COMMAND => return Some(MotorCommand::ContinuousStart),
            STOP_COMMAND => return Some(MotorCommand::EmergencyStop),
            _ => {}
        }

        let mut values = [0u8; STEP_COUNT];
        let mut count = 0;
        for (i, token) in text.split(',').enumerate() {
            let (digits, letter) = split_token(token)?;
            if i >= STEP_COUNT || letter != STEP_LETTERS[i] {
                return None;
            }
            // Digits only, so the sole parse failure is overflow
            values[i] = digits
                .parse::<u32>()
                .map_or(PWM_MAX as u8, |v| v.min(PWM_MAX as u32) as u8);
            count += 1;
        }

        (count == STEP_COUNT).then_some(MotorCommand::SoftStart6Step { values })
    }
}

impl fmt::Display for MotorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Clamp a PWM value into the firmware range `[0, 254]`.
#[inline]
pub fn clamp_pwm(value: i32) -> u8 {
    value.clamp(PWM_MIN, PWM_MAX) as u8
}

/// Encode a full 6-step soft start as one comma-joined payload.
///
/// Used by MQTT and the backend API, which send the whole ramp as one
/// message. No trailing terminator is appended.
pub fn encode_soft_start(values: &[i32; STEP_COUNT]) -> String {
    let tokens: Vec<String> = values
        .iter()
        .zip(STEP_LETTERS)
        .map(|(&value, letter)| format!("{}{}", clamp_pwm(value), letter))
        .collect();
    tokens.join(",")
}

/// Encode one step of a soft start as a single token.
///
/// Bluetooth streams the ramp one token at a time. Returns `None` for an
/// index outside `0..6`.
pub fn encode_single_step(index: usize, value: i32) -> Option<String> {
    let letter = STEP_LETTERS.get(index)?;
    Some(format!("{}{}", clamp_pwm(value), letter))
}

/// Wire text for a continuous start.
#[inline]
pub const fn encode_continuous() -> &'static str {
    CONTINUOUS_COMMAND
}

/// Wire text for an emergency stop.
#[inline]
pub const fn encode_stop() -> &'static str {
    STOP_COMMAND
}

/// Encode a speed as a Bluetooth telemetry byte (marker offset, modulo 256).
///
/// Returns `None` for speeds above [`PWM_MAX`].
pub fn encode_speed(speed: u8) -> Option<u8> {
    (i32::from(speed) <= PWM_MAX).then(|| speed.wrapping_add(SPEED_MARKER))
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode the speed carried by a Bluetooth telemetry frame.
///
/// Takes the first byte and subtracts [`SPEED_MARKER`] modulo 256. The
/// result is only valid in `[0, 254]`, so the single byte just below the
/// marker and empty frames yield `None`.
///
/// ```rust
/// use rs_softstart::protocol::decode_speed;
///
/// assert_eq!(decode_speed(&[0xD0]), Some(0));
/// assert_eq!(decode_speed(&[0xD0 + 40, 0xFF]), Some(40));
/// assert_eq!(decode_speed(&[0xCF]), None);
/// assert_eq!(decode_speed(&[]), None);
/// ```
pub fn decode_speed(frame: &[u8]) -> Option<u8> {
    let speed = frame.first()?.wrapping_sub(SPEED_MARKER);
    (i32::from(speed) <= PWM_MAX).then_some(speed)
}

/// Sanity check for an outbound or relayed command string.
///
/// Accepts exactly `"0i"`, exactly `"0p"`, or one or more comma-separated
/// `<digits><a-f>` tokens. Empty tokens (leading, trailing or doubled
/// commas) are rejected.
///
/// ```rust
/// use rs_softstart::protocol::validate_command;
///
/// assert!(validate_command("0i"));
/// assert!(validate_command("50a,100b"));
/// assert!(!validate_command("0i,"));
/// assert!(!validate_command("abc"));
/// ```
pub fn validate_command(text: &str) -> bool {
    if text == CONTINUOUS_COMMAND || text == STOP_COMMAND {
        return true;
    }
    !text.is_empty()
        && text.split(',').all(|token| {
            split_token(token).is_some_and(|(_, letter)| STEP_LETTERS.contains(&letter))
        })
}

/// Split a `<digits><letter>` token. Digits must be non-empty ASCII.
fn split_token(token: &str) -> Option<(&str, char)> {
    let letter = token.chars().last()?;
    let digits = &token[..token.len() - letter.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((digits, letter))
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Soft start encoding
    // =========================================================================

    #[test]
    fn soft_start_in_range() {
        assert_eq!(
            encode_soft_start(&[50, 100, 150, 200, 250, 254]),
            "50a,100b,150c,200d,250e,254f"
        );
    }

    #[test]
    fn soft_start_clamps_each_value() {
        assert_eq!(
            encode_soft_start(&[-5, 300, 10, 0, 254, 128]),
            "0a,254b,10c,0d,254e,128f"
        );
    }

    #[test]
    fn soft_start_has_six_tagged_tokens() {
        let inputs = [
            [i32::MIN, -1, 0, 1, 253, 255],
            [i32::MAX, 254, 254, 254, 254, 254],
            [7, 7, 7, 7, 7, 7],
        ];
        for input in inputs {
            let wire = encode_soft_start(&input);
            let tokens: Vec<&str> = wire.split(',').collect();
            assert_eq!(tokens.len(), STEP_COUNT);
            for (i, token) in tokens.iter().enumerate() {
                let (digits, letter) = split_token(token).unwrap();
                assert_eq!(letter, STEP_LETTERS[i]);
                let value: i32 = digits.parse().unwrap();
                assert!((PWM_MIN..=PWM_MAX).contains(&value));
            }
        }
    }

    #[test]
    fn single_step_tokens() {
        assert_eq!(encode_single_step(0, 50).as_deref(), Some("50a"));
        assert_eq!(encode_single_step(5, 999).as_deref(), Some("254f"));
        assert_eq!(encode_single_step(2, -3).as_deref(), Some("0c"));
        assert_eq!(encode_single_step(6, 10), None);
    }

    #[test]
    fn fixed_commands() {
        assert_eq!(encode_continuous(), "0i");
        assert_eq!(encode_stop(), "0p");
    }

    // =========================================================================
    // MotorCommand
    // =========================================================================

    #[test]
    fn command_from_slice_requires_six() {
        assert!(MotorCommand::soft_start_from_slice(&[1, 2, 3, 4, 5]).is_none());
        let cmd = MotorCommand::soft_start_from_slice(&[1, 2, 3, 4, 5, 6, 7]).unwrap();
        assert_eq!(cmd.encode(), "1a,2b,3c,4d,5e,6f");
    }

    #[test]
    fn command_type_labels() {
        assert_eq!(MotorCommand::soft_start([0; 6]).type_label(), "arranque6p");
        assert_eq!(MotorCommand::ContinuousStart.type_label(), "continuo");
        assert_eq!(MotorCommand::EmergencyStop.type_label(), "paro");
    }

    #[test]
    fn command_parse() {
        assert_eq!(MotorCommand::parse("0i"), Some(MotorCommand::ContinuousStart));
        assert_eq!(MotorCommand::parse("0p"), Some(MotorCommand::EmergencyStop));
        assert_eq!(
            MotorCommand::parse("10a,20b,30c,40d,50e,60f"),
            Some(MotorCommand::SoftStart6Step {
                values: [10, 20, 30, 40, 50, 60]
            })
        );
        // Out of order or short ramps are not commands
        assert_eq!(MotorCommand::parse("10b,20a,30c,40d,50e,60f"), None);
        assert_eq!(MotorCommand::parse("10a,20b"), None);
        assert_eq!(MotorCommand::parse(""), None);
    }

    #[test]
    fn command_values() {
        assert_eq!(MotorCommand::EmergencyStop.values(), Vec::<u8>::new());
        assert_eq!(
            MotorCommand::soft_start([1, 2, 3, 4, 5, 400]).values(),
            vec![1, 2, 3, 4, 5, 254]
        );
    }

    // =========================================================================
    // Speed decoding
    // =========================================================================

    #[test]
    fn decode_speed_marker_range() {
        for speed in 0..=254u8 {
            let byte = encode_speed(speed).unwrap();
            assert_eq!(decode_speed(&[byte]), Some(speed));
        }
    }

    #[test]
    fn decode_speed_rejects_byte_below_marker() {
        assert_eq!(decode_speed(&[SPEED_MARKER.wrapping_sub(1)]), None);
    }

    #[test]
    fn decode_speed_empty_frame() {
        assert_eq!(decode_speed(&[]), None);
    }

    #[test]
    fn decode_speed_uses_first_byte_only() {
        assert_eq!(decode_speed(&[0xD5, 0xCF, 0x00]), Some(5));
    }

    #[test]
    fn encode_speed_rejects_255() {
        assert_eq!(encode_speed(255), None);
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn validate_fixed_commands() {
        assert!(validate_command("0i"));
        assert!(validate_command("0p"));
    }

    #[test]
    fn validate_step_lists() {
        assert!(validate_command("50a,100b"));
        assert!(validate_command("50a,100b,150c,200d,250e,254f"));
        assert!(validate_command("7f"));
    }

    #[test]
    fn validate_rejects_malformed() {
        assert!(!validate_command("0i,"));
        assert!(!validate_command("abc"));
        assert!(!validate_command(""));
        assert!(!validate_command(",50a"));
        assert!(!validate_command("50a,,100b"));
        assert!(!validate_command("50g"));
        assert!(!validate_command("a"));
        assert!(!validate_command("-5a"));
        assert!(!validate_command("50A"));
    }
}
