use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(SessionId);
id_newtype!(SubscriptionId);

/// Feed event categories the timer registers interest in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    #[serde(rename = "channel.subscribe")]
    Subscribe,
    #[serde(rename = "channel.subscription.gift")]
    SubscriptionGift,
    #[serde(rename = "channel.cheer")]
    Cheer,
}

impl EventCategory {
    pub const ALL: [EventCategory; 3] = [Self::Subscribe, Self::SubscriptionGift, Self::Cheer];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "channel.subscribe",
            Self::SubscriptionGift => "channel.subscription.gift",
            Self::Cheer => "channel.cheer",
        }
    }

    pub fn from_type(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|category| category.as_str() == raw)
    }

    pub fn version(self) -> &'static str {
        "1"
    }
}

/// Bearer credential handed over by the auth collaborator.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub client_id: String,
    pub access_token: String,
    pub broadcaster_id: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("client_id", &self.client_id)
            .field("access_token", &"<redacted>")
            .field("broadcaster_id", &self.broadcaster_id)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Migrating,
    /// Reconnection budget spent; nothing retries until an operator reconnects.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    pub total_seconds: u64,
    pub remaining_seconds: u64,
    pub is_running: bool,
    /// Unix milliseconds of the last mutation.
    pub last_updated: i64,
}

impl TimerState {
    pub fn idle(now_ms: i64) -> Self {
        Self {
            total_seconds: 0,
            remaining_seconds: 0,
            is_running: false,
            last_updated: now_ms,
        }
    }
}

/// Durable form of [`TimerState`]; `carry_millis` holds sub-second credit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    #[serde(flatten)]
    pub state: TimerState,
    #[serde(default)]
    pub carry_millis: u16,
}

/// The `{remainingSeconds, isRunning}` pair pushed after every mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerUpdate {
    pub remaining_seconds: u64,
    pub is_running: bool,
}

impl From<&TimerState> for TimerUpdate {
    fn from(state: &TimerState) -> Self {
        Self {
            remaining_seconds: state.remaining_seconds,
            is_running: state.is_running,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThemeSettings {
    pub background: String,
    pub text: String,
    pub font: String,
    pub font_size: String,
}

impl Default for ThemeSettings {
    fn default() -> Self {
        Self {
            background: "#1f1f1f".into(),
            text: "#ffffff".into(),
            font: "Courier New".into(),
            font_size: "48px".into(),
        }
    }
}

impl ThemeSettings {
    /// Fills blank fields from the defaults, as older theme files may omit them.
    pub fn with_defaults(self) -> Self {
        let defaults = Self::default();
        let pick = |value: String, fallback: String| {
            if value.trim().is_empty() {
                fallback
            } else {
                value
            }
        };
        Self {
            background: pick(self.background, defaults.background),
            text: pick(self.text, defaults.text),
            font: pick(self.font, defaults.font),
            font_size: pick(self.font_size, defaults.font_size),
        }
    }
}

/// Seconds credited per feed event kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IncrementSettings {
    pub tier1_sub_time: f64,
    pub tier2_sub_time: f64,
    pub tier3_sub_time: f64,
    pub bits_time_increment: f64,
}

impl Default for IncrementSettings {
    fn default() -> Self {
        Self {
            tier1_sub_time: 5.0,
            tier2_sub_time: 10.0,
            tier3_sub_time: 15.0,
            bits_time_increment: 1.0,
        }
    }
}

impl IncrementSettings {
    pub fn validate(&self) -> Result<(), crate::error::SettingsError> {
        let fields = [
            ("tier1SubTime", self.tier1_sub_time),
            ("tier2SubTime", self.tier2_sub_time),
            ("tier3SubTime", self.tier3_sub_time),
            ("bitsTimeIncrement", self.bits_time_increment),
        ];
        for (field, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(crate::error::SettingsError::InvalidIncrement { field, value });
            }
        }
        Ok(())
    }
}

/// Settings document as the control surface submits it: increments plus
/// optional overlay theme fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    #[serde(flatten)]
    pub increments: IncrementSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_background: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_font: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_font_size: Option<u32>,
}

impl SettingsUpdate {
    /// Theme carried by the update, or `None` when no overlay field is set.
    pub fn theme(&self) -> Option<ThemeSettings> {
        if self.overlay_background.is_none()
            && self.overlay_text.is_none()
            && self.overlay_font.is_none()
            && self.overlay_font_size.is_none()
        {
            return None;
        }
        let defaults = ThemeSettings::default();
        Some(ThemeSettings {
            background: self
                .overlay_background
                .clone()
                .unwrap_or(defaults.background),
            text: self.overlay_text.clone().unwrap_or(defaults.text),
            font: self.overlay_font.clone().unwrap_or(defaults.font),
            font_size: format!("{}px", self.overlay_font_size.unwrap_or(48)),
        })
    }
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
