//! Human-readable prompts for verification events.

/// Prompt for the finger the service selected. With several readers
/// attached the reader name disambiguates which one to touch.
#[must_use]
pub fn finger_message(finger: &str, reader: Option<&str>, is_swipe: bool) -> String {
    let target = reader.unwrap_or("the fingerprint reader");
    let verb = if is_swipe { "Swipe" } else { "Place" };
    let finger_phrase = match finger {
        "left-thumb" => "your left thumb",
        "left-index-finger" => "your left index finger",
        "left-middle-finger" => "your left middle finger",
        "left-ring-finger" => "your left ring finger",
        "left-little-finger" => "your left little finger",
        "right-thumb" => "your right thumb",
        "right-index-finger" => "your right index finger",
        "right-middle-finger" => "your right middle finger",
        "right-ring-finger" => "your right ring finger",
        "right-little-finger" => "your right little finger",
        "any" => "your finger",
        _ => return format!("Scan your finger on {target}"),
    };
    if is_swipe {
        format!("{verb} {finger_phrase} across {target}")
    } else {
        format!("{verb} {finger_phrase} on {target}")
    }
}

/// Message for a non-terminal verify status; `None` for statuses the user
/// should not be bothered with.
#[must_use]
pub fn retry_message(result: &str, is_swipe: bool) -> Option<&'static str> {
    match result {
        "verify-swipe-too-short" => Some("Swipe was too short, try again"),
        "verify-finger-not-centered" => Some("Your finger was not centered, try again"),
        "verify-remove-and-retry" => Some("Remove your finger, and try again"),
        "verify-retry-scan" => {
            if is_swipe {
                Some("Failed to read the fingerprint, swipe again")
            } else {
                Some("Failed to read the fingerprint, place your finger again")
            }
        }
        _ => None,
    }
}
