use std::fmt;
use std::str::FromStr;

use jiff::Timestamp;

use crate::evtx_record::EvtxEvent;

/// Event severity as stored in `System/Level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Level {
    Critical = 1,
    Error = 2,
    Warning = 3,
    Information = 4,
    Verbose = 5,
}

impl Level {
    /// Level 0 (LogAlways) is reported as `Information`, like Event Viewer does.
    pub fn from_u8(level: u8) -> Option<Level> {
        match level {
            1 => Some(Level::Critical),
            2 => Some(Level::Error),
            3 => Some(Level::Warning),
            0 | 4 => Some(Level::Information),
            5 => Some(Level::Verbose),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Critical => "critical",
            Level::Error => "error",
            Level::Warning => "warning",
            Level::Information => "info",
            Level::Verbose => "verbose",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" | "1" => Ok(Level::Critical),
            "error" | "2" => Ok(Level::Error),
            "warning" | "3" => Ok(Level::Warning),
            "info" | "information" | "0" | "4" => Ok(Level::Information),
            "verbose" | "5" => Ok(Level::Verbose),
            other => Err(format!("unknown level `{other}`")),
        }
    }
}

/// Selects events by id, level and time range. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub event_ids: Vec<u32>,
    pub levels: Vec<Level>,
    /// Inclusive lower bound.
    pub since: Option<Timestamp>,
    /// Exclusive upper bound.
    pub until: Option<Timestamp>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.event_ids.is_empty()
            && self.levels.is_empty()
            && self.since.is_none()
            && self.until.is_none()
    }

    pub fn matches(&self, event: &EvtxEvent) -> bool {
        if !self.event_ids.is_empty()
            && !event
                .event_id()
                .is_some_and(|id| self.event_ids.contains(&id))
        {
            return false;
        }

        if !self.levels.is_empty()
            && !event
                .level()
                .and_then(Level::from_u8)
                .is_some_and(|level| self.levels.contains(&level))
        {
            return false;
        }

        let ts = event.timestamp();
        if self.since.is_some_and(|since| ts < since) {
            return false;
        }
        if self.until.is_some_and(|until| ts >= until) {
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binxml::deserializer::DecodedRecord;
    use crate::binxml::value_variant::BinXmlValue;
    use crate::evtx_record::{EvtxRecordHeader, assemble};
    use crate::model::xml::{XmlElement, XmlNode};

    // 2019-03-24T16:04:49Z
    const FILETIME: u64 = 0x01D4_E25B_4EE1_2E40;

    fn event(event_id: u16, level: u8) -> EvtxEvent {
        let field = |name: &str, value: BinXmlValue| {
            XmlNode::Element(XmlElement {
                children: vec![XmlNode::Value(value)],
                ..XmlElement::new(name)
            })
        };
        let system = XmlNode::Element(XmlElement {
            children: vec![
                field("EventID", BinXmlValue::UInt16Type(event_id)),
                field("Level", BinXmlValue::UInt8Type(level)),
            ],
            ..XmlElement::new("System")
        });
        let root = XmlNode::Element(XmlElement {
            children: vec![system],
            ..XmlElement::new("Event")
        });

        let header = EvtxRecordHeader {
            data_size: 64,
            event_record_id: 1,
            filetime: FILETIME,
            trailing_size: Some(64),
        };
        assemble(
            &header,
            DecodedRecord {
                nodes: vec![root],
                warnings: vec![],
            },
            0,
            false,
        )
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = EventFilter::new();
        assert!(filter.is_empty());
        assert!(filter.matches(&event(4624, 0)));
    }

    #[test]
    fn test_event_id_and_level() {
        let filter = EventFilter {
            event_ids: vec![4624, 4625],
            levels: vec![Level::Warning, Level::Error],
            ..EventFilter::default()
        };

        assert!(filter.matches(&event(4625, 2)));
        assert!(!filter.matches(&event(4625, 4)));
        assert!(!filter.matches(&event(4688, 2)));
    }

    #[test]
    fn test_log_always_counts_as_information() {
        assert_eq!(Level::from_u8(0), Some(Level::Information));
        assert_eq!(Level::from_u8(6), None);

        let info = EventFilter {
            levels: vec![Level::Information],
            ..EventFilter::default()
        };
        assert!(info.matches(&event(4624, 0)));
        assert!(info.matches(&event(7036, 4)));
        assert!(!info.matches(&event(7036, 3)));

        let errors = EventFilter {
            levels: vec![Level::Error],
            ..EventFilter::default()
        };
        assert!(!errors.matches(&event(4624, 0)));
    }

    #[test]
    fn test_time_range() {
        let at: Timestamp = "2019-03-24T16:04:49Z".parse().unwrap();
        let before: Timestamp = "2019-03-24T00:00:00Z".parse().unwrap();
        let after: Timestamp = "2019-03-25T00:00:00Z".parse().unwrap();

        let within = EventFilter {
            since: Some(before),
            until: Some(after),
            ..EventFilter::default()
        };
        assert!(within.matches(&event(1, 4)));

        let later = EventFilter {
            since: Some(after),
            ..EventFilter::default()
        };
        assert!(!later.matches(&event(1, 4)));

        let exclusive_end = EventFilter {
            until: Some(at),
            ..EventFilter::default()
        };
        // The event is 386ms past the full second.
        assert!(!exclusive_end.matches(&event(1, 4)));

        let inclusive_start = EventFilter {
            since: Some(event(1, 4).timestamp()),
            ..EventFilter::default()
        };
        assert!(inclusive_start.matches(&event(1, 4)));
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("INFO".parse::<Level>(), Ok(Level::Information));
        assert_eq!("2".parse::<Level>(), Ok(Level::Error));
        assert!("loud".parse::<Level>().is_err());
    }
}
