//! Device-token rows.

use serde::{Deserialize, Serialize};

/// Timezone bucket used when a row carries no tz.
pub const DEFAULT_TZ: &str = "-0500";

/// One row of an `{app}_{service}` device-token table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub token: String,
    #[serde(default)]
    pub locale: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default)]
    pub tz: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub seq_id: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl User {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
            ..Default::default()
        }
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn with_tz(mut self, tz: impl Into<String>) -> Self {
        self.tz = tz.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_seq_id(mut self, seq_id: i64) -> Self {
        self.seq_id = seq_id;
        self
    }

    /// Bucket key of this row.
    pub fn tz_or_default(&self) -> &str {
        if self.tz.is_empty() { DEFAULT_TZ } else { &self.tz }
    }

    /// Value of a filterable column.
    pub fn field(&self, column: &str) -> Option<&str> {
        match column {
            "user_id" => Some(&self.user_id),
            "token" => Some(&self.token),
            "locale" => Some(&self.locale),
            "region" => Some(&self.region),
            "tz" => Some(&self.tz),
            _ => None,
        }
    }
}

/// Whether a raw CSV cell is usable as a user id.
///
/// Ids end up inside an `IN (...)` list, so quotes, separators and control
/// characters are rejected outright.
pub fn is_user_id_valid(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 255
        && id
            .chars()
            .all(|c| !c.is_control() && !matches!(c, '\'' | '"' | ',' | ';' | '\\'))
}
