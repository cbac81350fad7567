/*!
 * Sample containers and the 291-character status string.
 *
 * The robot reports all three dewar locations in one string: three
 * 97-character segments (left, middle, right). Each segment starts with a
 * container type digit followed by one state code per port, in port order.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, Result};

/// Length of a full status string, whitespace excluded
pub const STATUS_LENGTH: usize = 291;

/// Length of one location's segment
pub const SEGMENT_LENGTH: usize = 97;

const PUCK_KEYS: &str = "ABCD";
const PUCK_PORTS: u8 = 16;
const CASSETTE_KEYS: &str = "ABCDEFGHIJKL";
const CASSETTE_PORTS: u8 = 8;

/// Dewar location
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Location {
    /// Left
    Left,
    /// Middle
    Middle,
    /// Right
    Right,
}

impl Location {
    /// All locations, in status string order
    pub const ALL: [Location; 3] = [Location::Left, Location::Middle, Location::Right];

    /// Location for a port prefix (`L`, `M` or `R`)
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'L' => Some(Location::Left),
            'M' => Some(Location::Middle),
            'R' => Some(Location::Right),
            _ => None,
        }
    }

    /// Port prefix
    pub fn as_char(self) -> char {
        match self {
            Location::Left => 'L',
            Location::Middle => 'M',
            Location::Right => 'R',
        }
    }

    fn index(self) -> usize {
        match self {
            Location::Left => 0,
            Location::Middle => 1,
            Location::Right => 2,
        }
    }
}

/// Kind of container sitting at a location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerType {
    /// Nothing loaded
    Empty,
    /// 12 x 8 cassette
    Cassette,
    /// Calibration cassette, same layout as a cassette
    CalibCassette,
    /// Adapter with four 16-port pucks
    Puck,
    /// Not determined
    Unknown,
    /// No information
    None,
}

impl ContainerType {
    /// Decode the leading type character of a segment
    pub fn from_code(code: char) -> Self {
        match code {
            '0' => ContainerType::Empty,
            '1' => ContainerType::Cassette,
            '2' => ContainerType::CalibCassette,
            '3' => ContainerType::Puck,
            '5' => ContainerType::None,
            _ => ContainerType::Unknown,
        }
    }

    /// Port keys and the number of ports per key
    fn layout(self) -> Option<(&'static str, u8)> {
        match self {
            ContainerType::Puck => Some((PUCK_KEYS, PUCK_PORTS)),
            ContainerType::Cassette | ContainerType::CalibCassette => {
                Some((CASSETTE_KEYS, CASSETTE_PORTS))
            }
            _ => None,
        }
    }
}

/// State of a single port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortState {
    /// No information
    None,
    /// No sample
    Empty,
    /// Sample present and probed good
    Good,
    /// Not probed
    Unknown,
    /// Sample is on the goniometer
    Mounted,
    /// Port jammed
    Jammed,
}

impl PortState {
    /// Decode a port code; unknown codes yield `None`
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            '0' | 'b' => Some(PortState::Empty),
            '1' => Some(PortState::Good),
            'u' => Some(PortState::Unknown),
            'm' => Some(PortState::Mounted),
            'j' => Some(PortState::Jammed),
            '-' => Some(PortState::None),
            _ => None,
        }
    }

    /// Whether a sample in this state may be mounted
    pub fn is_mountable(self) -> bool {
        matches!(self, PortState::Good | PortState::Mounted | PortState::Unknown)
    }
}

/// A port address such as `LA1` or `RD16`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortId {
    location: Location,
    key: char,
    index: u8,
}

impl PortId {
    /// Dewar location
    pub fn location(&self) -> Location {
        self.location
    }

    /// Address within the container (`A1`)
    pub fn slot(&self) -> String {
        format!("{}{}", self.key, self.index)
    }

    /// Robot parameter form: `LA1` becomes `l 1 A`
    pub fn to_param(&self) -> String {
        format!(
            "{} {} {}",
            self.location.as_char().to_ascii_lowercase(),
            self.index,
            self.key
        )
    }

    /// Parse the robot's `l 1 A` form; blank text means nothing mounted
    pub fn from_param(text: &str) -> Option<Self> {
        let parts: Vec<&str> = text.split_whitespace().collect();
        if parts.len() < 3 {
            return None;
        }
        format!("{}{}{}", parts[0].to_uppercase(), parts[2], parts[1])
            .parse()
            .ok()
    }
}

impl FromStr for PortId {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || DeviceError::invalid_argument(format!("Invalid port: {:?}", s));
        let mut chars = s.chars();
        let location = chars.next().and_then(Location::from_char).ok_or_else(invalid)?;
        let key = chars
            .next()
            .filter(|c| CASSETTE_KEYS.contains(*c))
            .ok_or_else(invalid)?;
        let digits = chars.as_str();
        if digits.is_empty() || digits.len() > 2 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let index = digits.parse().map_err(|_| invalid())?;
        Ok(Self {
            location,
            key,
            index,
        })
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.location.as_char(), self.key, self.index)
    }
}

/// Port state plus the barcode read for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSample {
    /// Port state
    pub state: PortState,
    /// Barcode, empty when unread
    pub barcode: String,
}

/// Contents of one dewar location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    location: Location,
    container_type: ContainerType,
    samples: BTreeMap<String, PortSample>,
}

impl Container {
    /// A location with no information
    pub fn unknown(location: Location) -> Self {
        Self {
            location,
            container_type: ContainerType::None,
            samples: BTreeMap::new(),
        }
    }

    /// Decode one segment of the status string
    pub fn parse(location: Location, segment: &[char]) -> Result<Self> {
        let container_type = segment
            .first()
            .map_or(ContainerType::None, |c| ContainerType::from_code(*c));
        let mut samples = BTreeMap::new();

        if let Some((keys, ports)) = container_type.layout() {
            let mut codes = segment.iter().skip(1);
            for key in keys.chars() {
                for index in 1..=ports {
                    let code = codes.next().ok_or_else(|| {
                        DeviceError::parse(format!("{:?} segment is truncated", location))
                    })?;
                    let state = PortState::from_code(*code).ok_or_else(|| {
                        DeviceError::parse(format!(
                            "Invalid port code {:?} at {}{}{}",
                            code,
                            location.as_char(),
                            key,
                            index
                        ))
                    })?;
                    samples.insert(
                        format!("{}{}", key, index),
                        PortSample {
                            state,
                            barcode: String::new(),
                        },
                    );
                }
            }
        }

        Ok(Self {
            location,
            container_type,
            samples,
        })
    }

    /// Dewar location
    pub fn location(&self) -> Location {
        self.location
    }

    /// Container type
    pub fn container_type(&self) -> ContainerType {
        self.container_type
    }

    /// Sample at a slot (`A1`)
    pub fn get(&self, slot: &str) -> Option<&PortSample> {
        self.samples.get(slot)
    }

    /// All slots and their samples
    pub fn samples(&self) -> impl Iterator<Item = (&str, &PortSample)> {
        self.samples.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of addressable ports
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the container has no addressable ports
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// The three dewar locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Containers([Container; 3]);

impl Default for Containers {
    fn default() -> Self {
        Self(Location::ALL.map(Container::unknown))
    }
}

impl Containers {
    /// Container at a location
    pub fn get(&self, location: Location) -> &Container {
        &self.0[location.index()]
    }

    /// State of a port; `None` when the port does not exist
    pub fn port_state(&self, port: &PortId) -> Option<PortState> {
        self.get(port.location())
            .get(&port.slot())
            .map(|sample| sample.state)
    }

    /// All containers in status string order
    pub fn iter(&self) -> impl Iterator<Item = &Container> {
        self.0.iter()
    }
}

/// Decode a full status string. Whitespace is ignored; anything but exactly
/// 291 remaining characters, or any unknown port code, is an error.
pub fn parse_states(text: &str) -> Result<Containers> {
    let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if chars.len() != STATUS_LENGTH {
        return Err(DeviceError::parse(format!(
            "Status string has {} characters, expected {}",
            chars.len(),
            STATUS_LENGTH
        )));
    }
    let mut segments = chars.chunks(SEGMENT_LENGTH);
    let mut next = |location| match segments.next() {
        Some(segment) => Container::parse(location, segment),
        None => Err(DeviceError::parse("Status string is truncated")),
    };
    Ok(Containers([
        next(Location::Left)?,
        next(Location::Middle)?,
        next(Location::Right)?,
    ]))
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::sim::sample_cassette_status as status_string;

    #[test]
    fn test_parse_status_string() {
        let containers = parse_states(&status_string()).unwrap();

        let left = containers.get(Location::Left);
        assert_eq!(left.container_type(), ContainerType::Puck);
        assert_eq!(left.len(), 64);
        assert_eq!(left.get("A1").unwrap().state, PortState::Good);
        assert_eq!(left.get("A2").unwrap().state, PortState::Jammed);
        assert_eq!(left.get("D16").unwrap().state, PortState::Unknown);
        assert!(left.get("E1").is_none());

        let middle = containers.get(Location::Middle);
        assert_eq!(middle.container_type(), ContainerType::Cassette);
        assert_eq!(middle.len(), 96);
        assert_eq!(middle.get("A1").unwrap().state, PortState::Mounted);
        assert_eq!(middle.get("A8").unwrap().state, PortState::Empty);
        assert_eq!(middle.get("L8").unwrap().state, PortState::Good);

        let right = containers.get(Location::Right);
        assert_eq!(right.container_type(), ContainerType::CalibCassette);
        assert!(right.samples().all(|(_, s)| s.state == PortState::Empty));
    }

    #[test]
    fn test_container_types_without_ports() {
        let segment = |code: char| {
            let mut s = String::new();
            s.push(code);
            s.push_str(&"u".repeat(96));
            s
        };
        for (code, expected) in [
            ('0', ContainerType::Empty),
            ('4', ContainerType::Unknown),
            ('5', ContainerType::None),
            ('x', ContainerType::Unknown),
            ('9', ContainerType::Unknown),
        ] {
            let text = format!("{}{}{}", segment(code), segment(code), segment(code));
            let containers = parse_states(&text).unwrap();
            assert_eq!(containers.get(Location::Middle).container_type(), expected);
            assert!(containers.get(Location::Middle).is_empty());
        }
    }

    #[test]
    fn test_wrong_length_is_rejected() {
        let mut text = status_string();
        text.pop();
        assert!(matches!(parse_states(&text), Err(DeviceError::Parse(_))));
        assert!(parse_states("").is_err());
    }

    #[test]
    fn test_unknown_port_code_is_rejected() {
        let text = status_string().replacen('j', "?", 1);
        assert!(matches!(parse_states(&text), Err(DeviceError::Parse(_))));
    }

    #[test]
    fn test_port_ids() {
        let port: PortId = "LA1".parse().unwrap();
        assert_eq!(port.to_param(), "l 1 A");
        assert_eq!(port.to_string(), "LA1");

        let port: PortId = "RD16".parse().unwrap();
        assert_eq!(port.to_param(), "r 16 D");
        assert_eq!(PortId::from_param(" r 16 D "), Some(port));
        assert_eq!(PortId::from_param(""), None);

        for bad in ["", "L", "XA1", "LZ1", "LA", "LA123", "la1", "LAx"] {
            assert!(bad.parse::<PortId>().is_err(), "{:?} should not parse", bad);
        }
    }

    #[test]
    fn test_mountable_states() {
        assert!(PortState::Good.is_mountable());
        assert!(PortState::Mounted.is_mountable());
        assert!(PortState::Unknown.is_mountable());
        assert!(!PortState::Empty.is_mountable());
        assert!(!PortState::Jammed.is_mountable());
        assert!(!PortState::None.is_mountable());
    }
}
