use std::time::Duration as StdDuration;

use serde::{Deserialize, Serialize};
use time::Duration;

/// User options. Injected into the loader; nothing reads these from
/// global state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Settings {
    /// Run the plane-change stage at all.
    pub generate_plane_change_burns: bool,
    /// Include the plane-change magnitude in the displayed total.
    pub add_plane_change_delta_v: bool,
    /// Allow the plane-change stage to remove nodes it did not create.
    pub delete_existing_maneuvers: bool,
    pub auto_target_destination: bool,
    pub auto_focus_destination: bool,
    pub auto_edit_ejection_node: bool,
    pub auto_edit_plane_change_node: bool,
    pub plane_change: PlaneChangeSettings,
    /// Lead time left before the ejection burn when warping.
    pub warp_margin_seconds: f64,
    /// Relative inclinations below this need no plane change.
    pub coplanar_tolerance_degrees: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            generate_plane_change_burns: true,
            add_plane_change_delta_v: false,
            delete_existing_maneuvers: false,
            auto_target_destination: true,
            auto_focus_destination: false,
            auto_edit_ejection_node: true,
            auto_edit_plane_change_node: false,
            plane_change: PlaneChangeSettings::default(),
            warp_margin_seconds: 60.0,
            coplanar_tolerance_degrees: 0.01,
        }
    }
}

impl Settings {
    pub fn coplanar_tolerance(&self) -> f64 {
        self.coplanar_tolerance_degrees.to_radians()
    }

    pub fn warp_margin(&self) -> Duration {
        Duration::seconds_f64(self.warp_margin_seconds.max(0.0))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct PlaneChangeSettings {
    pub max_iterations: u32,
    pub tolerance_degrees: f64,
    /// Pause between node edits so the host's solver can catch up.
    pub settle_millis: u64,
}

impl Default for PlaneChangeSettings {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            tolerance_degrees: 0.05,
            settle_millis: 25,
        }
    }
}

impl PlaneChangeSettings {
    pub fn tolerance(&self) -> f64 {
        self.tolerance_degrees.to_radians()
    }

    pub fn settle(&self) -> StdDuration {
        StdDuration::from_millis(self.settle_millis)
    }
}
