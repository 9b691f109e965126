use std::fmt;

use serde::{Deserialize, Serialize};

/// Evaluation area categories recognized by the converter.
///
/// The set is closed: any other `areatype` value in an uploaded package is a
/// validation failure. `ALL` fixes the canonical processing order so cache
/// keys, summary messages and output files always come out in the same
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Red2,
    Red,
    Yellow,
    Green,
    Green2,
    Green3,
    Constraints,
}

impl Category {
    /// Canonical processing order.
    pub const ALL: [Category; 7] = [
        Category::Red2,
        Category::Red,
        Category::Yellow,
        Category::Green,
        Category::Green2,
        Category::Green3,
        Category::Constraints,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Red2 => "red2",
            Category::Red => "red",
            Category::Yellow => "yellow",
            Category::Green => "green",
            Category::Green2 => "green2",
            Category::Green3 => "green3",
            Category::Constraints => "constraints",
        }
    }

    /// Strict parse of an `areatype` attribute value.
    pub fn parse(value: &str) -> Option<Category> {
        match value {
            "red2" => Some(Category::Red2),
            "red" => Some(Category::Red),
            "yellow" => Some(Category::Yellow),
            "green" => Some(Category::Green),
            "green2" => Some(Category::Green2),
            "green3" => Some(Category::Green3),
            "constraints" => Some(Category::Constraints),
            _ => None,
        }
    }

    /// Name of the per-category union document in the output area.
    pub fn union_filename(&self) -> String {
        format!("{}.json", self.as_str())
    }

    /// Name of the per-category intersection document in the output area.
    pub fn intersect_filename(&self) -> String {
        format!("{}-intersect.json", self.as_str())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_recognized_values() {
        for category in Category::ALL {
            assert_eq!(Category::parse(category.as_str()), Some(category));
        }
    }

    #[test]
    fn test_parse_rejects_unknown_values() {
        assert_eq!(Category::parse("blue"), None);
        assert_eq!(Category::parse("RED"), None);
        assert_eq!(Category::parse(" red"), None);
        assert_eq!(Category::parse(""), None);
    }

    #[test]
    fn test_all_order_is_stable() {
        let names: Vec<&str> = Category::ALL.iter().map(|c| c.as_str()).collect();
        assert_eq!(
            names,
            vec!["red2", "red", "yellow", "green", "green2", "green3", "constraints"]
        );
    }

    #[test]
    fn test_output_filenames() {
        assert_eq!(Category::Green.union_filename(), "green.json");
        assert_eq!(Category::Green.intersect_filename(), "green-intersect.json");
    }

    #[test]
    fn test_serializes_as_lowercase_name() {
        let json = serde_json::to_string(&Category::Constraints).unwrap();
        assert_eq!(json, "\"constraints\"");
        let back: Category = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Category::Constraints);
    }
}
