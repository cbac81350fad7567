/*!
 * Decoding of the robot's needs and reason bitmasks.
 */

/// Conditions the robot needs cleared before it will continue
pub const NEEDS: [(u32, &str); 7] = [
    (1, "inspect:staff"),
    (2, "reset"),
    (4, "calib:toolset"),
    (8, "calib:cassette"),
    (16, "calib:goniometer"),
    (32, "calib:initial"),
    (64, "action:user"),
];

/// Why the robot stopped
pub const REASONS: [(u32, &str); 15] = [
    (256, "emergency stop"),
    (512, "safeguard latched"),
    (1024, "not at home"),
    (4096, "lid jam"),
    (8192, "gripper jam"),
    (16384, "magnet missing"),
    (65536, "init error"),
    (131072, "toolset error"),
    (262144, "LN2 Level error"),
    (1048576, "cassette seating"),
    (2097152, "pin lost"),
    (4194304, "wrong state"),
    (16777216, "port occupied"),
    (33554432, "internal abort"),
    (67108864, "gonio unreachable"),
];

/// Table entries whose bit is set in `mask`, in table order
pub fn decode(mask: u32, table: &[(u32, &'static str)]) -> Vec<&'static str> {
    table
        .iter()
        .filter(|(bit, _)| mask & bit != 0)
        .map(|(_, text)| *text)
        .collect()
}

fn noun(prefix: &str) -> &str {
    match prefix {
        "inspect" => "inspection",
        "action" => "action",
        other => other,
    }
}

/// Render decoded needs as one sentence, e.g.
/// `Needs staff inspection, reset, calibration`. All calibration needs
/// collapse into a single trailing "calibration".
pub fn format_needs(needs: &[&str]) -> String {
    let mut parts = Vec::new();
    let mut calibration = false;
    for need in needs {
        match need.split_once(':') {
            Some(("calib", _)) => calibration = true,
            Some((prefix, sub)) => parts.push(format!("{} {}", sub, noun(prefix))),
            None => parts.push(need.to_string()),
        }
    }
    if calibration {
        parts.push("calibration".to_string());
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!("Needs {}", parts.join(", "))
    }
}

/// Render decoded reasons as one message
pub fn format_reasons(reasons: &[&str]) -> String {
    reasons.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_needs() {
        assert_eq!(decode(1 | 64, &NEEDS), vec!["inspect:staff", "action:user"]);
        assert!(decode(0, &NEEDS).is_empty());
        assert!(decode(256, &NEEDS).is_empty());
    }

    #[test]
    fn test_format_needs_collapses_calibration() {
        let needs = decode(1 | 2 | 4 | 8 | 32, &NEEDS);
        assert_eq!(format_needs(&needs), "Needs staff inspection, reset, calibration");
        assert_eq!(format_needs(&decode(64, &NEEDS)), "Needs user action");
        assert_eq!(format_needs(&[]), "");
    }

    #[test]
    fn test_decode_reasons() {
        let reasons = decode(512 | 8192 | 67108864, &REASONS);
        assert_eq!(reasons, vec!["safeguard latched", "gripper jam", "gonio unreachable"]);
        assert_eq!(format_reasons(&reasons), "safeguard latched, gripper jam, gonio unreachable");
    }
}
