//! Lifecycle enums for upload sessions, assets, and transcode jobs.
//!
//! All enums serialize in lowercase (via `serde(rename_all = "lowercase")`),
//! implement `Display` for the string stored in the database, and parse back
//! through `FromStr`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

use crate::Error;

macro_rules! lowercase_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// The lowercase name stored in the database and sent on the wire.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::Validation(format!(
                        "unknown {} '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// SessionStatus
// ---------------------------------------------------------------------------

/// State of a chunked upload session.
///
/// `Active` is the only state with outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Cancelled,
    Expired,
}

lowercase_enum!(SessionStatus {
    Active => "active",
    Completed => "completed",
    Cancelled => "cancelled",
    Expired => "expired",
});

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

// ---------------------------------------------------------------------------
// AssetStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a stored movie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Uploading,
    Processing,
    Ready,
    Error,
}

lowercase_enum!(AssetStatus {
    Uploading => "uploading",
    Processing => "processing",
    Ready => "ready",
    Error => "error",
});

impl AssetStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Error)
    }
}

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// State of a transcode job in the durable queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active,
    Succeeded,
    Failed,
}

lowercase_enum!(JobState {
    Queued => "queued",
    Active => "active",
    Succeeded => "succeeded",
    Failed => "failed",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_serde() {
        let json = serde_json::to_string(&AssetStatus::Processing).unwrap();
        assert_eq!(json, format!("\"{}\"", AssetStatus::Processing));
    }

    #[test]
    fn parse_round_trip() {
        for s in ["active", "completed", "cancelled", "expired"] {
            let status: SessionStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
        }
    }

    #[test]
    fn unknown_value_rejected() {
        let err = "paused".parse::<JobState>().unwrap_err();
        assert!(err.to_string().contains("JobState"));
    }

    #[test]
    fn terminal_states() {
        assert!(!SessionStatus::Active.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
        assert!(AssetStatus::Ready.is_terminal());
        assert!(AssetStatus::Error.is_terminal());
        assert!(!AssetStatus::Processing.is_terminal());
    }
}
