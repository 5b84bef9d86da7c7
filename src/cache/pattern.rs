//! Glob matching for bulk invalidation.
//!
//! `*` matches any substring (including the empty one); every other
//! character matches itself. Matches are anchored to the whole key.

use crate::{Error, ErrorContext, Result};
use regex::Regex;

#[derive(Debug, Clone)]
pub struct KeyPattern {
    glob: String,
    regex: Regex,
}

impl KeyPattern {
    pub fn new(glob: &str) -> Result<Self> {
        let body = glob
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^(?s:{})$", body)).map_err(|e| {
            Error::validation_with_context(
                format!("invalid key pattern: {}", e),
                ErrorContext::new()
                    .with_field_path("pattern")
                    .with_details(glob.to_string())
                    .with_source("key_pattern"),
            )
        })?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }
}
