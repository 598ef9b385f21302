use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ConflationError, Result};
use crate::network::WayFilter;

/// Thresholds for comparing route segments with network segments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LineComparisonOptions {
    /// Longest allowed line segment (meters)
    pub max_segment_length: f64,
    /// Largest orthogonal offset for the distance bit (meters)
    pub max_segment_orthogonal_distance: f64,
    /// Largest midpoint distance for the distance bit (meters)
    pub max_segment_mid_point_distance: f64,
    /// Search buffer grown around every segment's bounding box (meters)
    pub bounding_box_size: f64,
    /// Largest angle between matched segments (degrees)
    pub max_segment_angle: f64,
    /// Minimum alignment of a way with the route's upcoming heading
    pub min_future_vector_dot_product: f64,
    /// Number of upcoming route segments summed into the future vector
    pub future_vector_segments: usize,
}

impl Default for LineComparisonOptions {
    fn default() -> Self {
        Self {
            max_segment_length: 10.0,
            max_segment_orthogonal_distance: 10.0,
            max_segment_mid_point_distance: 20.0,
            bounding_box_size: 20.0,
            max_segment_angle: 45.0,
            min_future_vector_dot_product: 0.5,
            future_vector_segments: 4,
        }
    }
}

impl LineComparisonOptions {
    pub fn min_segment_dot_product(&self) -> f64 {
        self.max_segment_angle.to_radians().cos()
    }
}

/// Settings for one conflation run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflatorConfig {
    pub comparison: LineComparisonOptions,
    /// Side length of a spatial index cell (meters)
    pub cell_size: f64,
    /// Buffer grown around every cell (meters)
    pub cell_search_buffer: f64,
    /// Stops snap to an existing node this close (meters)
    pub stop_node_snap_distance: f64,
    /// Farthest way a stop may be projected onto (meters)
    pub stop_way_search_distance: f64,
    /// Cap on simultaneously tracked paths per leg
    pub max_paths_per_leg: usize,
    /// Route segments a path may wait before it is given up
    pub max_pending_steps: usize,
    pub path_score_weight: f64,
    /// Flat score bonus for a direction-aligned micro-segment
    pub direction_bonus: f64,
    /// Split ways where chosen paths enter or leave them mid-way
    pub split_ways_at_path_ends: bool,
    /// Verify the match index after every mutation (slow)
    pub check_integrity: bool,
    pub way_filter: WayFilter,
}

impl Default for ConflatorConfig {
    fn default() -> Self {
        let comparison = LineComparisonOptions::default();
        Self {
            cell_search_buffer: comparison.bounding_box_size,
            comparison,
            cell_size: 1000.0,
            stop_node_snap_distance: 8.0,
            stop_way_search_distance: 40.0,
            max_paths_per_leg: 64,
            max_pending_steps: 25,
            path_score_weight: 1.0,
            direction_bonus: 1.0,
            split_ways_at_path_ends: true,
            check_integrity: false,
            way_filter: WayFilter::default(),
        }
    }
}

impl ConflatorConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.comparison;
        let lengths = [
            ("max_segment_length", c.max_segment_length),
            ("max_segment_orthogonal_distance", c.max_segment_orthogonal_distance),
            ("max_segment_mid_point_distance", c.max_segment_mid_point_distance),
            ("bounding_box_size", c.bounding_box_size),
            ("cell_size", self.cell_size),
        ];
        for (name, value) in lengths {
            if value.is_nan() || value <= 0.0 || value.is_infinite() {
                return Err(ConflationError::InvalidConfig(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        let non_negative = [
            ("cell_search_buffer", self.cell_search_buffer),
            ("stop_node_snap_distance", self.stop_node_snap_distance),
            ("stop_way_search_distance", self.stop_way_search_distance),
        ];
        for (name, value) in non_negative {
            if value.is_nan() || value < 0.0 {
                return Err(ConflationError::InvalidConfig(format!(
                    "{} must not be negative, got {}",
                    name, value
                )));
            }
        }
        if !(c.max_segment_angle > 0.0 && c.max_segment_angle <= 90.0) {
            return Err(ConflationError::InvalidConfig(format!(
                "max_segment_angle must be in (0, 90], got {}",
                c.max_segment_angle
            )));
        }
        if !(-1.0..=1.0).contains(&c.min_future_vector_dot_product) {
            return Err(ConflationError::InvalidConfig(format!(
                "min_future_vector_dot_product must be in [-1, 1], got {}",
                c.min_future_vector_dot_product
            )));
        }
        if c.future_vector_segments == 0 || self.max_paths_per_leg == 0 {
            return Err(ConflationError::InvalidConfig(
                "future_vector_segments and max_paths_per_leg must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_defaults_validate() {
        let config = ConflatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cell_search_buffer, config.comparison.bounding_box_size);
        assert_relative_eq!(
            config.comparison.min_segment_dot_product(),
            std::f64::consts::FRAC_1_SQRT_2,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ConflatorConfig =
            serde_json::from_str(r#"{"comparison": {"max_segment_length": 5.0}, "max_paths_per_leg": 8}"#)
                .unwrap();
        assert_eq!(config.comparison.max_segment_length, 5.0);
        assert_eq!(config.comparison.max_segment_angle, 45.0);
        assert_eq!(config.max_paths_per_leg, 8);
        assert!(config.split_ways_at_path_ends);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ConflatorConfig::default();
        config.comparison.max_segment_length = 0.0;
        assert!(config.validate().is_err());

        let mut config = ConflatorConfig::default();
        config.comparison.max_segment_angle = 120.0;
        assert!(config.validate().is_err());

        let mut config = ConflatorConfig::default();
        config.comparison.min_future_vector_dot_product = 1.5;
        assert!(config.validate().is_err());
    }
}
