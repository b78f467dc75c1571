use thiserror::Error;

use crate::{Aabb3d, BuildContoursFlags, ConvexVolume, MAX_VERTICES_PER_POLYGON};

/// All parameters of a navmesh build, in the units the individual passes work with.
/// Usually created through [`NavmeshConfigBuilder`].
///
/// Values marked `vx` are in voxels: multiples of [`Self::cell_size`] on the xz-plane and of
/// [`Self::cell_height`] along the y-axis. Values marked `wu` are in world units.
///
/// A sensible starting point is to pick the agent's cylinder first, e.g. a radius of 0.4 and a
/// height of 2.0 for a human in a world measured in meters, and derive the voxel values from it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct NavmeshConfig {
    /// Number of cells along the x-axis, including the border. `[Units: vx]`
    pub width: u16,

    /// Number of cells along the z-axis, including the border. `[Units: vx]`
    pub height: u16,

    /// Side length of a tile on the xz-plane. Only used for tiled builds. `[Units: vx]`
    pub tile_size: u16,

    /// Padding of non-navigable cells around the field. `[Units: vx]`
    ///
    /// Tiled builds need it so the walkable area of neighboring tiles lines up.
    /// Polygon edges lying on the inner edge of the border are marked as portals.
    pub border_size: u16,

    /// Size of a cell on the xz-plane. `[Limit: > 0] [Units: wu]`
    ///
    /// Usually a half or a third of the agent radius. Smaller cells give a more detailed mesh,
    /// but the build time grows quadratically. Values below 0.05 tend to run into float precision issues.
    pub cell_size: f32,

    /// Size of a cell along the y-axis. `[Limit: > 0] [Units: wu]`
    ///
    /// Usually half of [`Self::cell_size`]. Lower it if curbs or stairs produce holes in the mesh.
    pub cell_height: f32,

    /// The world-space bounds of the field. `[Units: wu]`
    pub aabb: Aabb3d,

    /// The steepest slope that is still walkable. `[Limits: 0 <= value < 0.5*π] [Units: Radians]`
    pub walkable_slope_angle: f32,

    /// Minimum floor to ceiling clearance of a walkable span. `[Limit: >= 3] [Units: vx]`
    ///
    /// Computed from the agent height as `(h / cell_height).ceil()`.
    pub walkable_height: u16,

    /// Maximum height of a ledge the agent can still step onto. `[Limit: >=0] [Units: vx]`
    ///
    /// Computed from the agent's climb as `(max_climb / cell_height).floor()`.
    pub walkable_climb: u16,

    /// How far the walkable area is shrunk away from obstacles. `[Limit: >=0] [Units: vx]`
    ///
    /// Computed from the agent radius as `(r / cell_size).ceil()`. With a radius of zero the
    /// mesh hugs the geometry and runtime collision checks need to account for the agent's size themselves.
    pub walkable_radius: u16,

    /// Maximum length of a contour edge along the mesh border. Zero disables the limit. `[Limit: >=0] [Units: vx]`
    ///
    /// `walkable_radius * 8` is a good first guess.
    pub max_edge_len: u16,

    /// Maximum deviation of a simplified contour from the raw contour on the xz-plane. `[Limit: >=0] [Units: vx]`
    ///
    /// Values between 1.1 and 1.5 work well. Below that, edges become jagged; above it, corners get cut.
    pub max_simplification_error: f32,

    /// Regions with fewer spans than this are removed, unless they touch the tile border. `[Limit: >=0] [Units: vx]`
    pub min_region_area: u16,

    /// Regions with fewer spans than this are merged into a neighbor when possible. `[Limit: >=0] [Units: vx]`
    pub merge_region_area: u16,

    /// Maximum number of vertices of a polygon of the final mesh. `[Limits: 3..=12]`
    pub max_vertices_per_polygon: u16,

    /// Spacing of the height samples of the detail mesh. Zero disables sampling. `[Limits: 0 or >= 0.9 * cell_size] [Units: wu]`
    pub detail_sample_dist: f32,

    /// Maximum distance of the detail mesh surface from the heightfield. `[Limit: >=0] [Units: wu]`
    pub detail_sample_max_error: f32,

    /// Which edges get tessellated when building the [`ContourSet`](crate::ContourSet).
    pub contour_flags: BuildContoursFlags,

    /// Volumes that override the area type of the spans inside them.
    pub area_volumes: Vec<ConvexVolume>,
}

impl NavmeshConfig {
    /// Checks that the parameters describe a buildable field.
    ///
    /// # Errors
    ///
    /// Returns the first parameter found to be out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.cell_size > 0.0) || !(self.cell_height > 0.0) {
            return Err(ConfigError::InvalidCellSize {
                cell_size: self.cell_size,
                cell_height: self.cell_height,
            });
        }
        let nvp = self.max_vertices_per_polygon as usize;
        if !(3..=MAX_VERTICES_PER_POLYGON).contains(&nvp) {
            return Err(ConfigError::InvalidVerticesPerPolygon { got: nvp });
        }
        if self.walkable_height < 3 {
            return Err(ConfigError::WalkableHeightTooLow {
                got: self.walkable_height,
            });
        }
        if !(0.0..std::f32::consts::FRAC_PI_2).contains(&self.walkable_slope_angle) {
            return Err(ConfigError::InvalidSlope {
                got: self.walkable_slope_angle,
            });
        }
        if !(self.max_simplification_error >= 0.0) || !(self.detail_sample_max_error >= 0.0) {
            return Err(ConfigError::InvalidError {
                simplification: self.max_simplification_error,
                detail: self.detail_sample_max_error,
            });
        }
        if !self.aabb.is_valid() || self.aabb.min.x == self.aabb.max.x || self.aabb.min.z == self.aabb.max.z
        {
            return Err(ConfigError::InvalidAabb { aabb: self.aabb });
        }
        if self.detail_sample_dist != 0.0 && !(self.detail_sample_dist >= 0.9 * self.cell_size) {
            return Err(ConfigError::InvalidDetailSampleDistance {
                got: self.detail_sample_dist,
                min: 0.9 * self.cell_size,
            });
        }
        Ok(())
    }
}

/// A parameter of a [`NavmeshConfig`] that is out of range.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The cell size or height is not positive.
    #[error("Cell size {cell_size} and cell height {cell_height} must both be positive")]
    InvalidCellSize {
        /// The configured cell size.
        cell_size: f32,
        /// The configured cell height.
        cell_height: f32,
    },
    /// The polygon vertex limit is outside of the supported range.
    #[error("Polygons must have between 3 and {max} vertices, got {got}", max = MAX_VERTICES_PER_POLYGON)]
    InvalidVerticesPerPolygon {
        /// The configured limit.
        got: usize,
    },
    /// The walkable height is too low to tell floors from ceilings.
    #[error("Walkable height must be at least 3 voxels, got {got}")]
    WalkableHeightTooLow {
        /// The configured walkable height.
        got: u16,
    },
    /// The walkable slope is not in `[0, π/2)`.
    #[error("Walkable slope must be in [0, π/2), got {got}")]
    InvalidSlope {
        /// The configured slope in radians.
        got: f32,
    },
    /// One of the error tolerances is negative or NaN.
    #[error(
        "Simplification error {simplification} and detail sample error {detail} must not be negative"
    )]
    InvalidError {
        /// The configured contour simplification error.
        simplification: f32,
        /// The configured detail sample error.
        detail: f32,
    },
    /// The bounds are empty, inverted or not finite.
    #[error("The field bounds {aabb:?} are empty or invalid")]
    InvalidAabb {
        /// The configured bounds.
        aabb: Aabb3d,
    },
    /// The detail sample distance is positive but too small.
    #[error("Detail sample distance must be 0 or at least {min}, got {got}")]
    InvalidDetailSampleDistance {
        /// The configured distance.
        got: f32,
        /// The smallest accepted nonzero distance.
        min: f32,
    },
}

/// Describes a navmesh build in world units and derives a [`NavmeshConfig`] from it.
///
/// The defaults fit an adult human sized agent in a world measured in meters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct NavmeshConfigBuilder {
    /// See [`NavmeshConfig::cell_size`]. `[Units: wu]`
    pub cell_size: f32,
    /// See [`NavmeshConfig::cell_height`]. `[Units: wu]`
    pub cell_height: f32,
    /// Height of the agent, with a bit of padding. `[Units: wu]`
    pub agent_height: f32,
    /// Radius of the agent. `[Units: wu]`
    pub agent_radius: f32,
    /// Highest step the agent can climb. `[Units: wu]`
    pub agent_max_climb: f32,
    /// Steepest walkable slope. `[Units: Radians]`
    pub agent_max_slope: f32,
    /// Side length of the smallest region that is kept. `[Units: vx]`
    pub region_min_size: f32,
    /// Side length of the largest region that is merged into its neighbors. `[Units: vx]`
    pub region_merge_size: f32,
    /// Maximum length of a border contour edge. `[Units: wu]`
    pub edge_max_len: f32,
    /// See [`NavmeshConfig::max_simplification_error`]. `[Units: vx]`
    pub edge_max_error: f32,
    /// See [`NavmeshConfig::max_vertices_per_polygon`].
    pub verts_per_poly: u16,
    /// Detail sample spacing. Values below 0.9 disable sampling. `[Units: cell sizes]`
    pub detail_sample_dist: f32,
    /// Detail sample error. `[Units: cell heights]`
    pub detail_sample_max_error: f32,
    /// See [`NavmeshConfig::tile_size`]. `[Units: vx]`
    pub tile_size: u16,
    /// See [`NavmeshConfig::aabb`].
    pub aabb: Aabb3d,
    /// See [`NavmeshConfig::contour_flags`].
    pub contour_flags: BuildContoursFlags,
    /// Whether the field is a tile of a larger mesh. Tiles get a border so they line up with their neighbors.
    pub tiling: bool,
    /// See [`NavmeshConfig::area_volumes`].
    pub area_volumes: Vec<ConvexVolume>,
}

impl Default for NavmeshConfigBuilder {
    fn default() -> Self {
        Self {
            cell_size: 0.3,
            cell_height: 0.2,
            agent_height: 2.0,
            agent_radius: 0.6,
            agent_max_climb: 0.9,
            agent_max_slope: 45.0_f32.to_radians(),
            region_min_size: 8.0,
            region_merge_size: 20.0,
            edge_max_len: 12.0,
            edge_max_error: 1.3,
            verts_per_poly: 6,
            detail_sample_dist: 6.0,
            detail_sample_max_error: 1.0,
            tile_size: 32,
            aabb: Aabb3d::default(),
            contour_flags: BuildContoursFlags::default(),
            tiling: false,
            area_volumes: Vec::new(),
        }
    }
}

impl NavmeshConfigBuilder {
    /// Converts the world-space description into a [`NavmeshConfig`].
    pub fn build(self) -> NavmeshConfig {
        let walkable_radius = (self.agent_radius / self.cell_size).ceil() as u16;
        // Tiles need enough padding for erosion and the 3x3 filters to see their neighbors.
        let border_size = if self.tiling { walkable_radius + 3 } else { 0 };
        let (width, height) = if self.tiling {
            let side = self.tile_size + border_size * 2;
            (side, side)
        } else {
            let size = self.aabb.size() / self.cell_size + 0.5;
            (size.x as u16, size.z as u16)
        };
        NavmeshConfig {
            width,
            height,
            tile_size: self.tile_size,
            border_size,
            cell_size: self.cell_size,
            cell_height: self.cell_height,
            aabb: self.aabb,
            walkable_slope_angle: self.agent_max_slope,
            walkable_height: (self.agent_height / self.cell_height).ceil() as u16,
            walkable_climb: (self.agent_max_climb / self.cell_height).floor() as u16,
            walkable_radius,
            max_edge_len: (self.edge_max_len / self.cell_size) as u16,
            max_simplification_error: self.edge_max_error,
            min_region_area: (self.region_min_size * self.region_min_size) as u16,
            merge_region_area: (self.region_merge_size * self.region_merge_size) as u16,
            max_vertices_per_polygon: self.verts_per_poly,
            detail_sample_dist: if self.detail_sample_dist < 0.9 {
                0.0
            } else {
                self.cell_size * self.detail_sample_dist
            },
            detail_sample_max_error: self.cell_height * self.detail_sample_max_error,
            contour_flags: self.contour_flags,
            area_volumes: self.area_volumes,
        }
    }
}
