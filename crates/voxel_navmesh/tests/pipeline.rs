//! Runs the build stages on small scenes and checks the invariants of their outputs.

use std::collections::HashSet;

use glam::{UVec3, Vec3A};
use voxel_navmesh::{
    Aabb3d, AreaType, BuildContoursFlags, BvTree, CompactHeightfield, DETAIL_EDGE_BOUNDARY,
    HeightfieldBuilder, NavmeshConfig, NavmeshConfigBuilder, PORTAL_EDGE, RC_MESH_NULL_IDX,
    RegionId, SpanBuilder, SpanInsertion, TriMesh,
};

const DIR_OFFSET_X: [i32; 4] = [-1, 0, 1, 0];
const DIR_OFFSET_Z: [i32; 4] = [0, 1, 0, -1];

fn quad(trimesh: &mut TriMesh, corners: [[f32; 3]; 4]) {
    let base = trimesh.vertices.len() as u32;
    trimesh
        .vertices
        .extend(corners.iter().map(|corner| Vec3A::from_array(*corner)));
    trimesh.indices.extend([
        UVec3::new(base, base + 2, base + 1),
        UVec3::new(base, base + 3, base + 2),
    ]);
    trimesh
        .area_types
        .extend([AreaType::NOT_WALKABLE, AreaType::NOT_WALKABLE]);
}

/// A 20x20 ground plane with a 4x4 block of height 2 in the middle.
fn block_scene() -> TriMesh {
    let mut trimesh = TriMesh::default();
    quad(
        &mut trimesh,
        [
            [0.0, 0.0, 0.0],
            [20.0, 0.0, 0.0],
            [20.0, 0.0, 20.0],
            [0.0, 0.0, 20.0],
        ],
    );
    let (min, max, top) = (8.0, 12.0, 2.0);
    quad(
        &mut trimesh,
        [[min, top, min], [max, top, min], [max, top, max], [min, top, max]],
    );
    for [(x0, z0), (x1, z1)] in [
        [(min, min), (max, min)],
        [(max, min), (max, max)],
        [(max, max), (min, max)],
        [(min, max), (min, min)],
    ] {
        quad(
            &mut trimesh,
            [[x0, 0.0, z0], [x1, 0.0, z1], [x1, top, z1], [x0, top, z0]],
        );
    }
    trimesh
}

fn block_config(trimesh: &TriMesh) -> NavmeshConfig {
    NavmeshConfigBuilder {
        aabb: trimesh.compute_aabb().unwrap(),
        ..Default::default()
    }
    .build()
}

/// Runs the voxel stages of the build up to and including the distance field.
fn compact_block_scene(config: &NavmeshConfig) -> CompactHeightfield {
    let mut trimesh = block_scene();
    trimesh.mark_walkable_triangles(config.walkable_slope_angle);
    let mut heightfield = HeightfieldBuilder {
        aabb: config.aabb,
        cell_size: config.cell_size,
        cell_height: config.cell_height,
    }
    .build()
    .unwrap();
    heightfield
        .rasterize_triangles(&trimesh, config.walkable_climb)
        .unwrap();
    heightfield.filter_low_hanging_walkable_obstacles(config.walkable_climb);
    heightfield.filter_ledge_spans(config.walkable_height, config.walkable_climb);
    heightfield.filter_walkable_low_height_spans(config.walkable_height);
    let mut compact = heightfield
        .into_compact(config.walkable_height, config.walkable_climb)
        .unwrap();
    compact.erode_walkable_area(config.walkable_radius);
    compact.build_distance_field();
    compact
}

fn span_indices(compact: &CompactHeightfield) -> Vec<(u16, u16, usize)> {
    let mut indices = Vec::new();
    for z in 0..compact.height {
        for x in 0..compact.width {
            indices.extend(compact.cell_at(x, z).index_range().map(|i| (x, z, i)));
        }
    }
    indices
}

fn neighbor(compact: &CompactHeightfield, x: u16, z: u16, i: usize, dir: u8) -> Option<(u16, u16, usize)> {
    let con = compact.spans[i].con(dir)?;
    let nx = (x as i32 + DIR_OFFSET_X[dir as usize]) as u16;
    let nz = (z as i32 + DIR_OFFSET_Z[dir as usize]) as u16;
    Some((nx, nz, compact.cell_at(nx, nz).index() as usize + con as usize))
}

#[test]
fn rasterized_scene_has_sorted_disjoint_spans() {
    let trimesh = block_scene();
    let config = block_config(&trimesh);
    let mut heightfield = HeightfieldBuilder {
        aabb: config.aabb,
        cell_size: config.cell_size,
        cell_height: config.cell_height,
    }
    .build()
    .unwrap();
    heightfield
        .rasterize_triangles(&trimesh, config.walkable_climb)
        .unwrap();
    for z in 0..heightfield.height {
        for x in 0..heightfield.width {
            let spans: Vec<_> = heightfield.column(x, z).map(|(_, span)| span.clone()).collect();
            for span in &spans {
                assert!(span.min() < span.max());
            }
            for pair in spans.windows(2) {
                assert!(pair[0].max() < pair[1].min(), "spans of ({x}, {z}) overlap");
            }
        }
    }
}

#[test]
fn compact_connections_are_symmetric() {
    let trimesh = block_scene();
    let compact = compact_block_scene(&block_config(&trimesh));
    assert!(!compact.spans.is_empty());
    for (x, z, i) in span_indices(&compact) {
        for dir in 0..4_u8 {
            let Some((nx, nz, ni)) = neighbor(&compact, x, z, i, dir) else {
                continue;
            };
            let back = neighbor(&compact, nx, nz, ni, (dir + 2) & 0x3);
            assert_eq!(back, Some((x, z, i)), "span {i} at ({x}, {z}) in direction {dir}");
        }
    }
}

#[test]
fn distance_field_is_zero_on_borders_and_bounded() {
    let trimesh = block_scene();
    let compact = compact_block_scene(&block_config(&trimesh));
    assert!(compact.max_distance > 0);
    for (x, z, i) in span_indices(&compact) {
        let distance = compact.dist[i];
        assert!(distance <= compact.max_distance);
        let is_border = (0..4).any(|dir| match neighbor(&compact, x, z, i, dir) {
            Some((_, _, ni)) => compact.areas[ni] != compact.areas[i],
            None => true,
        });
        if is_border {
            assert_eq!(distance, 0, "border span {i} at ({x}, {z})");
        }
    }
}

#[test]
fn flat_plane_is_a_single_region() {
    let mut trimesh = TriMesh::default();
    quad(
        &mut trimesh,
        [
            [0.0, 0.0, 0.0],
            [10.0, 0.0, 0.0],
            [10.0, 0.0, 10.0],
            [0.0, 0.0, 10.0],
        ],
    );
    trimesh.mark_walkable_triangles(45.0_f32.to_radians());
    let mut heightfield = HeightfieldBuilder {
        aabb: trimesh.compute_aabb().unwrap(),
        cell_size: 0.5,
        cell_height: 0.2,
    }
    .build()
    .unwrap();
    heightfield.rasterize_triangles(&trimesh, 4).unwrap();
    let mut compact = heightfield.into_compact(10, 4).unwrap();
    compact.build_distance_field();
    compact.build_regions(0, 8, 20).unwrap();

    let regions: HashSet<RegionId> = compact.spans.iter().map(|span| span.region).collect();
    assert_eq!(regions.len(), 1);
    assert!(regions.iter().all(|region| region.is_interior()));
    assert_eq!(compact.max_region, RegionId::from(1));
}

#[test]
fn stacked_layers_produce_one_contour_each() {
    let mut heightfield = HeightfieldBuilder {
        aabb: Aabb3d::new([0.0, 0.0, 0.0], [1.0, 10.0, 1.0]),
        cell_size: 0.2,
        cell_height: 0.2,
    }
    .build()
    .unwrap();
    assert_eq!((heightfield.width, heightfield.height), (5, 5));
    for z in 0..5 {
        for x in 0..5 {
            for (min, max) in [(10, 20), (25, 30)] {
                heightfield
                    .add_span(SpanInsertion {
                        x,
                        z,
                        flag_merge_threshold: 0,
                        span: SpanBuilder {
                            min,
                            max,
                            area: AreaType::DEFAULT_WALKABLE,
                            next: None,
                        }
                        .build(),
                    })
                    .unwrap();
            }
        }
    }
    let mut compact = heightfield.into_compact(2, 1).unwrap();
    compact.build_distance_field();
    compact.build_regions(1, 1, 1).unwrap();

    let contours = compact.build_contours(1.3, 12, BuildContoursFlags::default());
    assert_eq!(contours.contours.len(), 2);
    let mut floors: Vec<u16> = contours
        .contours
        .iter()
        .map(|contour| contour.vertices[0].0.y)
        .collect();
    floors.sort_unstable();
    assert_eq!(floors, [20, 30]);

    // Contour tracing only reads the field, so a second pass gives the same result.
    let again = compact.build_contours(1.3, 12, BuildContoursFlags::default());
    assert_eq!(contours, again);
}

#[test]
fn polygons_are_bounded_and_neighbors_are_mutual() {
    let trimesh = block_scene();
    let config = block_config(&trimesh);
    let (mesh, _) = trimesh.generate_navmesh(&config).unwrap();
    assert!(mesh.polygon_count() > 1);
    let nvp = config.max_vertices_per_polygon as usize;
    for i in 0..mesh.polygon_count() {
        let polygon = mesh.polygon(i);
        assert!((3..=nvp).contains(&polygon.len()), "polygon {i} has {} vertices", polygon.len());
        assert!(polygon.iter().all(|&v| (v as usize) < mesh.vertices().len()));

        let neighbors = mesh.polygon_neighbors(i);
        assert_eq!(neighbors.len(), polygon.len());
        for (edge, &other) in neighbors.iter().enumerate() {
            if other == RC_MESH_NULL_IDX || other & PORTAL_EDGE != 0 {
                continue;
            }
            let (a, b) = (polygon[edge], polygon[(edge + 1) % polygon.len()]);
            let other_polygon = mesh.polygon(other as usize);
            let shared = (0..other_polygon.len()).find(|&k| {
                other_polygon[k] == b && other_polygon[(k + 1) % other_polygon.len()] == a
            });
            let Some(shared) = shared else {
                panic!("polygon {other} has no edge matching edge {edge} of polygon {i}");
            };
            assert_eq!(mesh.polygon_neighbors(other as usize)[shared], i as u16);
        }
    }
}

#[test]
fn detail_mesh_follows_the_surface() {
    let trimesh = block_scene();
    let config = block_config(&trimesh);
    let (mesh, detail) = trimesh.generate_navmesh(&config).unwrap();
    assert_eq!(detail.meshes.len(), mesh.polygon_count());
    assert_eq!(detail.triangles.len(), detail.triangle_flags.len());

    for i in 0..mesh.polygon_count() {
        let vertices = detail.submesh_vertices(i);
        let triangles = detail.submesh_triangles(i);
        assert!(vertices.len() >= mesh.polygon(i).len());
        assert!(!triangles.is_empty());
        for triangle in triangles {
            assert!(triangle.iter().all(|&v| (v as usize) < vertices.len()));
        }
        for vertex in vertices {
            let on_ground = vertex.y.abs() < 0.6;
            let on_block = (vertex.y - 2.0).abs() < 0.6;
            assert!(on_ground || on_block, "detail vertex {vertex} is off the surface");
        }
    }
    let boundary_edges = detail
        .triangle_flags
        .iter()
        .map(|&flags| {
            (0..3_u8)
                .filter(|k| (flags >> (k * 2)) & DETAIL_EDGE_BOUNDARY != 0)
                .count()
        })
        .sum::<usize>();
    assert!(boundary_edges > 0);
}

#[test]
fn generation_is_deterministic() {
    let trimesh = block_scene();
    let config = block_config(&trimesh);
    let first = trimesh.clone().generate_navmesh(&config).unwrap();
    let second = trimesh.generate_navmesh(&config).unwrap();
    assert_eq!(first, second);
}

#[test]
fn bv_tree_finds_polygons_near_the_block() {
    let trimesh = block_scene();
    let config = block_config(&trimesh);
    let (mesh, detail) = trimesh.generate_navmesh(&config).unwrap();

    for tree in [BvTree::new(&mesh, None), BvTree::new(&mesh, Some(&detail))] {
        assert_eq!(tree.nodes().len(), mesh.polygon_count() * 2 - 1);
        let mut everything = tree.query_aabb(&mesh.aabb());
        everything.sort_unstable();
        assert_eq!(everything, (0..mesh.polygon_count()).collect::<Vec<_>>());

        let corner = Aabb3d::new([0.0, -1.0, 0.0], [1.5, 1.0, 1.5]);
        let found = tree.query_aabb(&corner);
        assert!(!found.is_empty());
        for polygon in found {
            let (min_x, min_z) = mesh.polygon(polygon).iter().fold(
                (f32::MAX, f32::MAX),
                |(min_x, min_z), &v| {
                    let world = mesh.world_vertex(mesh.vertices()[v as usize]);
                    (min_x.min(world.x), min_z.min(world.z))
                },
            );
            // The query box is rounded outwards to the quantization grid.
            assert!(
                min_x <= 2.5 && min_z <= 2.5,
                "polygon {polygon} is far from the queried corner"
            );
        }
    }
}

#[cfg(feature = "serialize")]
#[test]
fn navmesh_survives_json_round_trip() {
    let trimesh = block_scene();
    let config = block_config(&trimesh);
    let (mesh, detail) = trimesh.generate_navmesh(&config).unwrap();

    let json = serde_json::to_string(&mesh).unwrap();
    let mesh_back: voxel_navmesh::PolygonNavmesh = serde_json::from_str(&json).unwrap();
    assert_eq!(mesh, mesh_back);

    let json = serde_json::to_string(&detail).unwrap();
    let detail_back: voxel_navmesh::DetailNavmesh = serde_json::from_str(&json).unwrap();
    assert_eq!(detail, detail_back);

    let json = serde_json::to_string(&config).unwrap();
    let config_back: NavmeshConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(config, config_back);
}
