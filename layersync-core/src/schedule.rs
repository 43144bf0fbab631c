//! Day-of-month update schedules.
//!
//! A layer's `update_days` is written as `[1-5]` (inclusive range) or
//! `[1, 15, 28]` (list), either as a YAML sequence or as a quoted string.
//! Items may mix days and ranges (`[1-5, 15]`). Days outside `1..=31` are
//! ignored; anything unparseable never schedules the layer.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Days of the month on which a layer is due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawDays", into = "String")]
pub struct UpdateDays {
    raw: String,
    days: BTreeSet<u32>,
}

impl UpdateDays {
    pub fn parse(raw: &str) -> Self {
        Self {
            raw: raw.to_owned(),
            days: parse_days(raw.trim()),
        }
    }

    pub fn days(&self) -> &BTreeSet<u32> {
        &self.days
    }

    pub fn includes(&self, day_of_month: u32) -> bool {
        self.days.contains(&day_of_month)
    }
}

const FIRST_DAY: u32 = 1;
const LAST_DAY: u32 = 31;

fn parse_days(text: &str) -> BTreeSet<u32> {
    let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) else {
        return BTreeSet::new();
    };
    let mut days = BTreeSet::new();
    for item in inner.split(',').map(str::trim).filter(|i| !i.is_empty()) {
        let parsed = match item.split_once('-') {
            Some((start, end)) => start
                .trim()
                .parse::<u32>()
                .ok()
                .zip(end.trim().parse::<u32>().ok()),
            None => item.parse::<u32>().ok().map(|d| (d, d)),
        };
        let Some((start, end)) = parsed else {
            return BTreeSet::new();
        };
        days.extend(start.max(FIRST_DAY)..=end.min(LAST_DAY));
    }
    days
}

/// The two ways `update_days` appears in a layer file.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDays {
    Text(String),
    List(Vec<DayItem>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DayItem {
    Day(i64),
    Range(String),
}

impl From<RawDays> for UpdateDays {
    fn from(raw: RawDays) -> Self {
        match raw {
            RawDays::Text(s) => Self::parse(&s),
            RawDays::List(items) => {
                let items: Vec<String> = items
                    .into_iter()
                    .map(|item| match item {
                        DayItem::Day(d) => d.to_string(),
                        DayItem::Range(r) => r,
                    })
                    .collect();
                Self::parse(&format!("[{}]", items.join(", ")))
            }
        }
    }
}

impl From<UpdateDays> for String {
    fn from(d: UpdateDays) -> Self {
        d.raw
    }
}

impl fmt::Display for UpdateDays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.raw.fmt(f)
    }
}

/// Whether a layer with `update_days` should run on `day_of_month`.
pub fn is_due(update_days: Option<&UpdateDays>, day_of_month: u32) -> bool {
    update_days.is_some_and(|d| d.includes(day_of_month))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("[1-5]", 3, true)]
    #[case("[1-5]", 5, true)]
    #[case("[1-5]", 6, false)]
    #[case("[1, 15, 28]", 15, true)]
    #[case("[1,15,28]", 14, false)]
    #[case("1-5", 3, false)]
    #[case("", 1, false)]
    #[case("[a-b]", 1, false)]
    #[case("[1-5, 15]", 15, true)]
    #[case("[1-5, 15]", 10, false)]
    #[case("[25-40]", 31, true)]
    #[case("[0, 32]", 1, false)]
    fn parses_schedule(#[case] raw: &str, #[case] day: u32, #[case] due: bool) {
        assert_eq!(is_due(Some(&UpdateDays::parse(raw)), day), due, "{raw} on {day}");
    }

    #[test]
    fn absent_schedule_is_never_due() {
        assert!(!is_due(None, 1));
    }

    #[test]
    fn huge_ranges_are_clamped_to_the_month() {
        let days = UpdateDays::parse("[1-4000000000]");
        assert_eq!(days.days().len(), 31);
        assert_eq!(days.days().iter().next_back(), Some(&31));
    }

    #[rstest]
    #[case("[1, 15, 28]", &[1, 15, 28])]
    #[case("[1-3]", &[1, 2, 3])]
    #[case("'[1-3]'", &[1, 2, 3])]
    #[case("[1-2, 20]", &[1, 2, 20])]
    fn yaml_sequences_and_strings_both_load(#[case] yaml: &str, #[case] expected: &[u32]) {
        let days: UpdateDays = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(days.days().iter().copied().collect::<Vec<_>>(), expected, "{yaml}");
    }
}
