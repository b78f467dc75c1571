use anyhow::Context as _;
use glam::Vec3;

use crate::{DetailNavmesh, HeightfieldBuilder, NavmeshConfig, PolygonNavmesh, TriMesh};

impl TriMesh {
    /// Runs the whole build on this mesh: voxelization, filtering, region partitioning,
    /// contour tracing, polygonization and height detail.
    ///
    /// The area types of walkable triangles are overwritten based on
    /// [`NavmeshConfig::walkable_slope_angle`]. Set the area types of triangles that should never
    /// be walked on to [`AreaType::NOT_WALKABLE`](crate::AreaType::NOT_WALKABLE) beforehand,
    /// they stay that way unless their slope is walkable.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or any stage of the build fails.
    /// The error's context names the failing stage.
    pub fn generate_navmesh(
        mut self,
        config: &NavmeshConfig,
    ) -> anyhow::Result<(PolygonNavmesh, DetailNavmesh)> {
        let _span = tracing::info_span!("generate_navmesh").entered();
        config.validate().context("Invalid navmesh config")?;

        self.mark_walkable_triangles(config.walkable_slope_angle);

        let mut aabb = config.aabb;
        let padding = Vec3::new(1.0, 0.0, 1.0) * (config.border_size as f32 * config.cell_size);
        aabb.min -= padding;
        aabb.max += padding;
        let mut heightfield = HeightfieldBuilder {
            aabb,
            cell_size: config.cell_size,
            cell_height: config.cell_height,
        }
        .build()
        .context("Failed to create heightfield")?;

        heightfield
            .rasterize_triangles(&self, config.walkable_climb)
            .context("Failed to rasterize triangles")?;

        // Rasterization is conservative, so overhangs need to be cleaned up
        // before removing the spans no agent can stand on.
        heightfield.filter_low_hanging_walkable_obstacles(config.walkable_climb);
        heightfield.filter_ledge_spans(config.walkable_height, config.walkable_climb);
        heightfield.filter_walkable_low_height_spans(config.walkable_height);

        let mut compact_heightfield = heightfield
            .into_compact(config.walkable_height, config.walkable_climb)
            .context("Failed to build compact heightfield")?;

        compact_heightfield.erode_walkable_area(config.walkable_radius);
        for volume in &config.area_volumes {
            compact_heightfield.mark_convex_poly_area(volume);
        }

        compact_heightfield.build_distance_field();
        compact_heightfield
            .build_regions(
                config.border_size,
                config.min_region_area,
                config.merge_region_area,
            )
            .context("Failed to build regions")?;

        let contours = compact_heightfield.build_contours(
            config.max_simplification_error,
            config.max_edge_len,
            config.contour_flags,
        );

        let polygon_mesh = contours
            .into_polygon_mesh(config.max_vertices_per_polygon as usize)
            .context("Failed to build polygon mesh")?;

        let detail_mesh = DetailNavmesh::new(
            &polygon_mesh,
            &compact_heightfield,
            config.detail_sample_dist,
            config.detail_sample_max_error,
        )
        .context("Failed to build detail mesh")?;

        tracing::info!(
            polygons = polygon_mesh.polygon_count(),
            detail_triangles = detail_mesh.triangles.len(),
            "Generated navmesh"
        );
        Ok((polygon_mesh, detail_mesh))
    }
}

#[cfg(test)]
mod tests {
    use glam::{UVec3, Vec3A};

    use crate::{Aabb3d, AreaType, NavmeshConfigBuilder};

    use super::*;

    fn plane(size: f32) -> TriMesh {
        TriMesh {
            vertices: vec![
                Vec3A::new(0.0, 0.0, 0.0),
                Vec3A::new(size, 0.0, 0.0),
                Vec3A::new(size, 0.0, size),
                Vec3A::new(0.0, 0.0, size),
            ],
            indices: vec![UVec3::new(0, 2, 1), UVec3::new(0, 3, 2)],
            area_types: vec![AreaType::NOT_WALKABLE; 2],
        }
    }

    #[test]
    fn invalid_config_is_reported() {
        let trimesh = plane(10.0);
        let config = NavmeshConfigBuilder {
            aabb: trimesh.compute_aabb().unwrap(),
            verts_per_poly: 2,
            ..Default::default()
        }
        .build();
        let error = trimesh.generate_navmesh(&config).unwrap_err();
        assert!(error.to_string().contains("Invalid navmesh config"));
    }

    #[test]
    fn plane_becomes_walkable_mesh() {
        let trimesh = plane(10.0);
        let config = NavmeshConfigBuilder {
            aabb: trimesh.compute_aabb().unwrap(),
            ..Default::default()
        }
        .build();
        let (polygon_mesh, detail_mesh) = trimesh.generate_navmesh(&config).unwrap();
        assert!(polygon_mesh.polygon_count() > 0);
        assert_eq!(detail_mesh.meshes.len(), polygon_mesh.polygon_count());
        for vertex in polygon_mesh.vertices() {
            let world = polygon_mesh.world_vertex(*vertex);
            // Eroded by the agent radius of two cells.
            assert!(world.x >= 0.5 && world.x <= 9.5, "{world}");
            assert!(world.z >= 0.5 && world.z <= 9.5, "{world}");
        }
    }

    #[test]
    fn steep_plane_is_not_walkable() {
        let mut trimesh = plane(10.0);
        for vertex in &mut trimesh.vertices {
            vertex.y = vertex.x * 3.0;
        }
        let config = NavmeshConfigBuilder {
            aabb: trimesh.compute_aabb().unwrap(),
            ..Default::default()
        }
        .build();
        let (polygon_mesh, detail_mesh) = trimesh.generate_navmesh(&config).unwrap();
        assert_eq!(polygon_mesh.polygon_count(), 0);
        assert!(detail_mesh.meshes.is_empty());
    }

    #[test]
    fn tiled_build_marks_portals() {
        let trimesh = plane(10.0);
        let config = NavmeshConfigBuilder {
            aabb: Aabb3d::new([2.0, -1.0, 2.0], [8.0, 1.0, 8.0]),
            tiling: true,
            tile_size: 20,
            ..Default::default()
        }
        .build();
        let (polygon_mesh, _) = trimesh.generate_navmesh(&config).unwrap();
        let has_portal = (0..polygon_mesh.polygon_count()).any(|i| {
            polygon_mesh
                .polygon_neighbors(i)
                .iter()
                .any(|&neighbor| neighbor != crate::RC_MESH_NULL_IDX && neighbor & crate::PORTAL_EDGE != 0)
        });
        assert!(has_portal);
    }
}
