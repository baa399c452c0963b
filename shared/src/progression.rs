use serde::{Deserialize, Serialize};

/// Level-up fact returned by the gamification service after an accepted paint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelUp {
    pub old_level: u32,
    pub new_level: u32,
    pub new_title: String,
    pub levels_gained: u32,
    #[serde(default)]
    pub is_significant_level_up: bool,
    #[serde(default)]
    pub phase_changed: bool,
}
