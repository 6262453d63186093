//! Target table selection
//!
//! A table is either fixed or computed per event from a pattern:
//!
//! - `%{path}` inserts an event field (`message`, `source`, `offset`, or a
//!   dotted path into the event's fields);
//! - `%{+format}` formats the event timestamp with strftime syntax.
//!
//! A reference to a missing field is kept literally. Characters outside
//! `[A-Za-z0-9_]` in the result become `_`.

use std::collections::HashMap;
use std::fmt::Write;

use chrono::format::{Item, StrftimeItems};
use courier_protocol::Event;

use super::error::StreamLoadError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `%{path}`
    Field(String),
    /// `%{+format}`, a strftime format
    Time(String),
}

/// Parsed table name pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePattern {
    segments: Vec<Segment>,
}

impl TablePattern {
    /// Time formats are checked here, not at render time
    pub fn parse(pattern: &str) -> Result<Self, StreamLoadError> {
        let mut segments = Vec::new();
        let mut rest = pattern;

        while let Some(start) = rest.find("%{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| StreamLoadError::pattern(pattern, "unterminated %{"))?;
            let reference = &after[..end];

            if let Some(format) = reference.strip_prefix('+') {
                if format.is_empty() || StrftimeItems::new(format).any(|i| matches!(i, Item::Error)) {
                    return Err(StreamLoadError::pattern(
                        pattern,
                        format!("invalid time format '{format}'"),
                    ));
                }
                segments.push(Segment::Time(format.to_string()));
            } else if reference.is_empty() {
                return Err(StreamLoadError::pattern(pattern, "empty field reference"));
            } else {
                segments.push(Segment::Field(reference.to_string()));
            }
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    /// Table name for one event
    pub fn render(&self, event: &Event) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(path) => match event.lookup(path) {
                    Some(value) => out.push_str(&value),
                    None => {
                        let _ = write!(out, "%{{{path}}}");
                    }
                },
                Segment::Time(format) => {
                    let _ = write!(out, "{}", event.timestamp().format(format));
                }
            }
        }
        sanitize(&out)
    }
}

/// Replace characters that are not valid in an unquoted table name
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Where a payload's events are loaded
#[derive(Debug, Clone)]
pub enum TableTarget {
    Static(String),
    Pattern(TablePattern),
}

impl TableTarget {
    /// Group event indices by target table, tables in first-seen order
    pub fn group(&self, events: &[Event]) -> Vec<(String, Vec<usize>)> {
        match self {
            Self::Static(table) => vec![(table.clone(), (0..events.len()).collect())],
            Self::Pattern(pattern) => {
                let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
                let mut index: HashMap<String, usize> = HashMap::new();
                for (i, event) in events.iter().enumerate() {
                    let table = pattern.render(event);
                    match index.get(&table) {
                        Some(&slot) => groups[slot].1.push(i),
                        None => {
                            index.insert(table.clone(), groups.len());
                            groups.push((table, vec![i]));
                        }
                    }
                }
                groups
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn event(service: &str) -> Event {
        Event::builder("hello")
            .timestamp(Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap())
            .source("/var/log/app.log")
            .field("service", service)
            .field("kubernetes", serde_json::json!({"namespace": "prod-eu"}))
            .build()
    }

    #[test]
    fn test_render_fields_and_time() {
        let pattern = TablePattern::parse("app_%{service}_%{+%Y%m}").unwrap();
        assert_eq!(pattern.render(&event("billing")), "app_billing_202403");

        let nested = TablePattern::parse("logs_%{kubernetes.namespace}").unwrap();
        assert_eq!(nested.render(&event("x")), "logs_prod_eu");
    }

    #[test]
    fn test_missing_field_kept_literally() {
        let pattern = TablePattern::parse("logs_%{team}").unwrap();
        assert_eq!(pattern.render(&event("x")), "logs___team_");
    }

    #[test]
    fn test_parse_errors() {
        assert!(TablePattern::parse("logs_%{service").is_err());
        assert!(TablePattern::parse("logs_%{}").is_err());
        assert!(TablePattern::parse("logs_%{+}").is_err());
        assert!(TablePattern::parse("logs_%{+%Q}").is_err());
    }

    #[test]
    fn test_group_preserves_first_seen_order() {
        let target = TableTarget::Pattern(TablePattern::parse("t_%{service}").unwrap());
        let events = vec![event("b"), event("a"), event("b"), event("c")];
        let groups = target.group(&events);
        assert_eq!(
            groups,
            vec![
                ("t_b".to_string(), vec![0, 2]),
                ("t_a".to_string(), vec![1]),
                ("t_c".to_string(), vec![3]),
            ]
        );

        let fixed = TableTarget::Static("events".into()).group(&events);
        assert_eq!(fixed, vec![("events".to_string(), vec![0, 1, 2, 3])]);
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("a-b.c d"), "a_b_c_d");
        assert_eq!(sanitize("ok_123"), "ok_123");
    }
}
