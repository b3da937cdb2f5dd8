use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};

/// Finished outcome of an outfit recommendation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PlanResult {
    Success(PlanSubject),
    Warning {
        #[serde(default)]
        destination: String,
        #[serde(default)]
        warning: String,
    },
    Error {
        #[serde(default)]
        error: String,
    },
}

/// What a successful plan was made for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PlanSubject {
    Travel {
        #[serde(default)]
        destination: String,
        #[serde(default)]
        date: String,
    },
    Event {
        #[serde(default)]
        event: String,
    },
    #[serde(other)]
    Other,
}

impl PlanResult {
    pub fn travel(destination: impl Into<String>, date: impl Into<String>) -> Self {
        Self::Success(PlanSubject::Travel {
            destination: destination.into(),
            date: date.into(),
        })
    }

    pub fn event(event: impl Into<String>) -> Self {
        Self::Success(PlanSubject::Event {
            event: event.into(),
        })
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    /// Text of the assistant message announcing this plan.
    ///
    /// `None` for a success of an unrecognized kind, which produces no message.
    pub fn assistant_reply(&self) -> Option<String> {
        let reply = match self {
            Self::Success(PlanSubject::Travel { destination, date }) => format!(
                "Here are your outfit suggestions for {destination} on {}. I've checked the weather and found some great options for you!",
                display_date(date)
            ),
            Self::Success(PlanSubject::Event { event }) => format!(
                "Here are your outfit suggestions for the {event}. I've curated some perfect looks for the occasion!"
            ),
            Self::Success(PlanSubject::Other) => return None,
            Self::Warning {
                destination,
                warning,
            } => format!("I found outfit suggestions for {destination}, but please note: {warning}"),
            Self::Error { error } => format!(
                "Sorry, I encountered an error: {error}. Please try again with a different request."
            ),
        };

        Some(reply)
    }
}

/// Renders plan dates as short US dates (`6/1/2024`); unparseable input is kept as-is.
fn display_date(raw: &str) -> String {
    let raw = raw.trim();
    let parsed = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|timestamp| timestamp.date_naive())
        });

    match parsed {
        Some(date) => date.format("%-m/%-d/%Y").to_string(),
        None => raw.to_string(),
    }
}
