//! ---
//! parley_section: "02-cross-context-messaging"
//! parley_subsection: "module"
//! parley_type: "source"
//! parley_scope: "code"
//! parley_description: "Cross-context message bus, arbitration and broadcaster."
//! parley_version: "v0.0.0-prealpha"
//! parley_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{BusError, Result};

/// Known action vocabulary, namespaced `domain:subsystem:verb`.
///
/// Adding an action is additive. Renaming or removing one breaks every
/// context that still uses the old name, since there is no handshake.
pub mod known {
    /// Stop any ongoing speech.
    pub const SPEAKING_STOP: &str = "service:speaking:stop";
    /// Start speaking the supplied text.
    pub const SPEAKING_START: &str = "service:speaking:start";
    /// Query whether speech is in progress.
    pub const SPEAKING_STATE: &str = "service:speaking:state";
    /// Read a stored setting.
    pub const SETTINGS_GET: &str = "service:settings:get";
    /// Write a stored setting.
    pub const SETTINGS_SET: &str = "service:settings:set";
    /// List voices offered by the host.
    pub const VOICES_LIST: &str = "service:voices:list";
    /// Progress of the current utterance changed.
    pub const PROGRESS_UPDATE: &str = "broadcaster:progress:update";
    /// Progress tracking was reset.
    pub const PROGRESS_RESET: &str = "broadcaster:progress:reset";
    /// Speech started somewhere in the extension.
    pub const SPEAKING_STARTED: &str = "broadcaster:speaking:started";
    /// Speech stopped somewhere in the extension.
    pub const SPEAKING_STOPPED: &str = "broadcaster:speaking:stopped";

    /// Every action listed above.
    pub const ALL: &[&str] = &[
        SPEAKING_STOP,
        SPEAKING_START,
        SPEAKING_STATE,
        SETTINGS_GET,
        SETTINGS_SET,
        VOICES_LIST,
        PROGRESS_UPDATE,
        PROGRESS_RESET,
        SPEAKING_STARTED,
        SPEAKING_STOPPED,
    ];
}

/// Validated action name carried by every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Action(String);

impl Action {
    /// Validate and wrap an action name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if Self::is_well_formed(&name) {
            Ok(Self(name))
        } else {
            Err(BusError::InvalidAction(name))
        }
    }

    /// Borrow the raw action string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading namespace segment, e.g. `service`.
    pub fn domain(&self) -> &str {
        self.0.split(':').next().unwrap_or_default()
    }

    /// Whether the action belongs to [`known::ALL`].
    pub fn is_known(&self) -> bool {
        known::ALL.contains(&self.0.as_str())
    }

    fn is_well_formed(name: &str) -> bool {
        let segments: Vec<&str> = name.split(':').collect();
        segments.len() >= 3
            && segments.iter().all(|segment| {
                !segment.is_empty()
                    && segment
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Action {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Action {
    type Error = BusError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        action.0
    }
}

impl std::str::FromStr for Action {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}
