//! Current date/time tool.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::{Value, json};
use streamweave_core::error::ToolError;
use streamweave_core::tool::{Tool, ToolArguments};
use tracing::debug;

pub struct DateTimeTool;

impl DateTimeTool {
    fn render<T: TimeZone>(now: DateTime<T>, format: &str) -> String
    where
        T::Offset: std::fmt::Display,
    {
        if format.eq_ignore_ascii_case("human") {
            now.format("%A, %B %d, %Y at %I:%M %p %Z").to_string()
        } else {
            now.to_rfc3339()
        }
    }

    /// Render `instant` for the named zone; unknown zones render as UTC.
    pub fn describe(instant: DateTime<Utc>, timezone: &str, format: &str) -> Value {
        let datetime = match timezone.parse::<Tz>() {
            Ok(tz) => Self::render(instant.with_timezone(&tz), format),
            Err(_) => {
                debug!(timezone, "Unknown timezone, using UTC");
                Self::render(instant, format)
            }
        };
        json!({
            "datetime": datetime,
            "timestamp": instant.timestamp(),
            "timezone": timezone,
        })
    }
}

#[async_trait]
impl Tool for DateTimeTool {
    fn name(&self) -> &str {
        "get_current_datetime"
    }

    fn description(&self) -> &str {
        "Get current date and time in specified timezone"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "timezone": {
                    "type": "string",
                    "description": "Timezone name (e.g., 'UTC', 'Asia/Jakarta')"
                },
                "format": {
                    "type": "string",
                    "description": "Output format ('iso', 'human')"
                }
            }
        })
    }

    async fn execute(&self, arguments: ToolArguments) -> Result<Value, ToolError> {
        let timezone = arguments.str("timezone").unwrap_or("UTC");
        let format = arguments.str("format").unwrap_or("iso");
        Ok(Self::describe(Utc::now(), timezone, format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 9, 30, 0).unwrap()
    }

    #[test]
    fn iso_in_named_zone() {
        let out = DateTimeTool::describe(instant(), "Asia/Jakarta", "iso");
        assert_eq!(out["datetime"], "2024-03-15T16:30:00+07:00");
        assert_eq!(out["timestamp"], 1710495000);
        assert_eq!(out["timezone"], "Asia/Jakarta");
    }

    #[test]
    fn human_format() {
        let out = DateTimeTool::describe(instant(), "UTC", "human");
        assert_eq!(out["datetime"], "Friday, March 15, 2024 at 09:30 AM UTC");
    }

    #[test]
    fn unknown_zone_falls_back_to_utc() {
        let out = DateTimeTool::describe(instant(), "Mars/Olympus", "iso");
        assert_eq!(out["datetime"], "2024-03-15T09:30:00+00:00");
        assert_eq!(out["timezone"], "Mars/Olympus");
    }

    #[tokio::test]
    async fn execute_defaults_to_utc_iso() {
        let out = DateTimeTool.execute(ToolArguments::default()).await.unwrap();
        assert_eq!(out["timezone"], "UTC");
        assert!(out["datetime"].as_str().unwrap().ends_with("+00:00"));
    }
}
