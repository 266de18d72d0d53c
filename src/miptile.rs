//! Mip/tile visibility planning
//!
//! **Why**: A 16K plate never needs to be fully resident. Given the cameras
//! looking at a target this module computes, per mip level, the rectangle of
//! tiles that actually has to be decoded this frame.
//!
//! **Used by**: Loader (merges requirements into its prefetch decisions).
//!
//! # Strategies
//!
//! Two closed strategies, chosen per target at registration time:
//!
//! - `Planar`: quadtree descent from the coarsest mip. Tiles are culled by a
//!   frustum/bounding-sphere test; surviving tiles estimate the required mip
//!   level at each corner from the screen-space footprint of one texel, and
//!   descend to finer levels only where needed.
//! - `Spherical`: lat-long sphere targets. Tile-grid corners are mapped to
//!   the sphere surface and point-tested against the frustum; coarser levels
//!   are a conservative downscale of the mip-0 selection.
//!
//! Identical inputs always produce identical output: the only mutable state
//! is a per-pass corner memo that is cleared between passes.

use std::collections::{HashMap, VecDeque};

use glam::{IVec2, Mat4, UVec2, Vec2, Vec3, Vec4, Vec4Swizzles};
use indexmap::IndexMap;
use log::trace;
use uuid::Uuid;

/// Half-open rectangle over a mip level's tile grid.
///
/// Visible iff `top_left < bottom_right` componentwise; the default value is
/// the empty (invisible) selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSelection {
    pub top_left: IVec2,
    pub bottom_right: IVec2,
}

impl Default for TileSelection {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl TileSelection {
    pub const EMPTY: TileSelection = TileSelection {
        top_left: IVec2::new(i32::MAX, i32::MAX),
        bottom_right: IVec2::new(i32::MIN, i32::MIN),
    };

    /// Whole-grid selection for a given tile grid
    pub fn full(grid: UVec2) -> Self {
        Self {
            top_left: IVec2::ZERO,
            bottom_right: IVec2::new(grid.x as i32, grid.y as i32),
        }
    }

    pub fn is_visible(&self) -> bool {
        self.top_left.x < self.bottom_right.x && self.top_left.y < self.bottom_right.y
    }

    /// Grow the rectangle to include one tile
    pub fn include(&mut self, tile: IVec2) {
        self.top_left = self.top_left.min(tile);
        self.bottom_right = self.bottom_right.max(tile + IVec2::ONE);
    }

    /// Union with another selection (empty operands are identity)
    pub fn union(&self, other: &TileSelection) -> TileSelection {
        if !self.is_visible() {
            return *other;
        }
        if !other.is_visible() {
            return *self;
        }
        TileSelection {
            top_left: self.top_left.min(other.top_left),
            bottom_right: self.bottom_right.max(other.bottom_right),
        }
    }

    pub fn contains(&self, tile: IVec2) -> bool {
        self.is_visible()
            && tile.x >= self.top_left.x
            && tile.y >= self.top_left.y
            && tile.x < self.bottom_right.x
            && tile.y < self.bottom_right.y
    }

    /// Conservative covering of this selection at a coarser mip level:
    /// bounds halve per level, rounding outward.
    pub fn scaled_down(&self, levels: u32) -> TileSelection {
        if !self.is_visible() {
            return TileSelection::EMPTY;
        }
        let div = 1i32 << levels;
        TileSelection {
            top_left: IVec2::new(self.top_left.x / div, self.top_left.y / div),
            bottom_right: IVec2::new(
                (self.bottom_right.x + div - 1) / div,
                (self.bottom_right.y + div - 1) / div,
            ),
        }
    }

    /// Number of tiles covered
    pub fn num_tiles(&self) -> usize {
        if !self.is_visible() {
            return 0;
        }
        let d = self.bottom_right - self.top_left;
        (d.x as usize) * (d.y as usize)
    }
}

/// Static geometry of one sequence as seen by the planner
#[derive(Debug, Clone)]
pub struct SequenceInfo {
    pub name: String,
    /// Pixel dimensions at mip 0
    pub dim: UVec2,
    /// Tile grid dimensions at mip 0
    pub tile_grid: UVec2,
    pub num_mip_levels: u32,
}

impl SequenceInfo {
    /// Tile grid at a given mip level.
    ///
    /// Halves per level rounding UP (a partial tile row/column still needs a
    /// tile), never below 1x1. Matches `ceil(ceil(dim / 2^level) / tile_size)`
    /// for the tile size implied by the mip-0 grid.
    pub fn tile_grid_at(&self, level: u32) -> UVec2 {
        let div = 1u32 << level;
        UVec2::new(
            self.tile_grid.x.div_ceil(div).max(1),
            self.tile_grid.y.div_ceil(div).max(1),
        )
    }
}

/// One camera looking at a registered target
#[derive(Debug, Clone, Copy)]
pub struct CameraInfo {
    /// Camera location in the target's space
    pub location: Vec3,
    /// Combined view-projection matrix (target-local -> clip space)
    pub view_projection: Mat4,
    /// Viewport size in pixels
    pub viewport: Vec2,
    /// Additional LOD bias applied on top of the per-target bias
    pub mip_bias: f32,
}

/// Projection strategy for one registered target.
///
/// Closed set by design: the loader switches on it at plan time.
#[derive(Debug, Clone, Copy)]
pub enum TargetStrategy {
    /// Flat plate; the camera's view-projection maps plate-local space
    /// (x/y in-plane, z=0, centered at origin) to clip space
    Planar,
    /// Lat-long sphere; `transform` maps the unit sphere to world space
    Spherical { transform: Mat4 },
}

#[derive(Debug, Clone, Copy)]
struct TargetInfo {
    /// World-space width of the target (plate width / sphere diameter hint)
    width_hint: f32,
    lod_bias: f32,
    strategy: TargetStrategy,
}

/// View frustum as six inward-facing planes (Gribb-Hartmann extraction)
#[derive(Debug, Clone, Copy)]
struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    fn from_view_projection(vp: &Mat4) -> Self {
        let r = vp.transpose();
        let rows = [r.x_axis, r.y_axis, r.z_axis, r.w_axis];
        let raw = [
            rows[3] + rows[0], // left
            rows[3] - rows[0], // right
            rows[3] + rows[1], // bottom
            rows[3] - rows[1], // top
            rows[3] + rows[2], // near
            rows[3] - rows[2], // far
        ];
        let mut planes = [Vec4::ZERO; 6];
        for (i, p) in raw.iter().enumerate() {
            let len = p.xyz().length();
            planes[i] = if len > f32::EPSILON { *p / len } else { *p };
        }
        Self { planes }
    }

    fn sphere_visible(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|p| p.xyz().dot(center) + p.w >= -radius)
    }

    fn point_visible(&self, point: Vec3) -> bool {
        self.sphere_visible(point, 0.0)
    }
}

/// Per-mip-level tile requirements for one frame
pub type TilePlan = Vec<TileSelection>;

/// Computes which tiles of which mip levels the registered targets need.
///
/// Not safe for concurrent `calculate_visible_tiles` calls on one instance;
/// the loader serializes access behind its own mutex.
#[derive(Debug, Default)]
pub struct MipTileInfo {
    /// Registration order is the (deterministic) aggregation order
    targets: IndexMap<Uuid, TargetInfo>,
    /// Corner-level memo, keyed by mip-0 corner address. Valid for one
    /// camera pass only; cleared before each pass.
    corner_memo: HashMap<(i32, i32), f32>,
}

impl MipTileInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a target. `width_hint` is the target's world
    /// size; `lod_bias` biases every mip decision for this target.
    pub fn register_target(
        &mut self,
        handle: Uuid,
        width_hint: f32,
        lod_bias: f32,
        strategy: TargetStrategy,
    ) {
        trace!("Target {} registered (width_hint={})", handle, width_hint);
        self.targets.insert(
            handle,
            TargetInfo {
                width_hint,
                lod_bias,
                strategy,
            },
        );
    }

    pub fn unregister_target(&mut self, handle: &Uuid) {
        if self.targets.shift_remove(handle).is_some() {
            trace!("Target {} unregistered", handle);
        }
    }

    pub fn has_targets(&self) -> bool {
        !self.targets.is_empty()
    }

    /// Compute the union of per-mip-level tile requirements over all
    /// registered targets and all cameras.
    ///
    /// Returns one TileSelection per mip level; an empty selection means the
    /// level is not needed. With no targets registered every level is empty
    /// and the caller falls back to "whole frame, mip 0".
    pub fn calculate_visible_tiles(
        &mut self,
        cameras: &[CameraInfo],
        seq: &SequenceInfo,
    ) -> TilePlan {
        let mut plan = vec![TileSelection::EMPTY; seq.num_mip_levels as usize];
        if self.targets.is_empty() || cameras.is_empty() {
            return plan;
        }

        let targets: Vec<TargetInfo> = self.targets.values().copied().collect();
        for target in &targets {
            match target.strategy {
                TargetStrategy::Planar => {
                    for camera in cameras {
                        self.corner_memo.clear();
                        self.plan_planar(camera, target, seq, &mut plan);
                    }
                }
                TargetStrategy::Spherical { transform } => {
                    self.plan_spherical(cameras, &transform, seq, &mut plan);
                }
            }
        }

        plan
    }

    // ===== Planar strategy =====

    /// Quadtree descent over one camera's frustum.
    fn plan_planar(
        &mut self,
        camera: &CameraInfo,
        target: &TargetInfo,
        seq: &SequenceInfo,
        plan: &mut TilePlan,
    ) {
        let frustum = Frustum::from_view_projection(&camera.view_projection);

        // Plate geometry in target-local space: centered at origin, z=0
        let plate_w = target.width_hint;
        let plate_h = target.width_hint * seq.dim.y as f32 / seq.dim.x as f32;
        let plate = Vec2::new(plate_w, plate_h);
        // World-space footprint of one mip-0 texel
        let texel = plate_w / seq.dim.x as f32;
        let bias = target.lod_bias + camera.mip_bias;

        let coarsest = seq.num_mip_levels - 1;
        let mut queue: VecDeque<(IVec2, u32)> = VecDeque::new();
        let grid_c = seq.tile_grid_at(coarsest);
        for ty in 0..grid_c.y as i32 {
            for tx in 0..grid_c.x as i32 {
                queue.push_back((IVec2::new(tx, ty), coarsest));
            }
        }

        while let Some((tile, level)) = queue.pop_front() {
            let grid = seq.tile_grid_at(level);
            let uv_min = Vec2::new(
                tile.x as f32 / grid.x as f32,
                tile.y as f32 / grid.y as f32,
            );
            let uv_max = Vec2::new(
                (tile.x + 1) as f32 / grid.x as f32,
                (tile.y + 1) as f32 / grid.y as f32,
            )
            .min(Vec2::ONE);

            let p_min = (uv_min - 0.5) * plate;
            let p_max = (uv_max - 0.5) * plate;
            let center = ((p_min + p_max) * 0.5).extend(0.0);
            let radius = ((p_max - p_min) * 0.5).length();

            if !frustum.sphere_visible(center, radius) {
                continue;
            }

            // Corner lattice addresses at mip 0 (memo key shared between
            // overlapping tiles across levels)
            let corner_uvs = [uv_min, Vec2::new(uv_max.x, uv_min.y), Vec2::new(uv_min.x, uv_max.y), uv_max];
            let mut min_level = f32::MAX;
            let mut max_level = f32::MIN;
            let mut visible_corners = 0u32;

            for (i, uv) in corner_uvs.iter().enumerate() {
                let world = ((*uv - 0.5) * plate).extend(0.0);
                if frustum.point_visible(world) {
                    visible_corners += 1;
                }

                let cx = (tile.x + (i as i32 & 1)) << level;
                let cy = (tile.y + (i as i32 >> 1)) << level;
                let key = (cx, cy);
                let corner_level = match self.corner_memo.get(&key) {
                    Some(l) => *l,
                    None => {
                        // Clamp after biasing: a negative bias must saturate
                        // at full resolution, not drop the tile entirely
                        let l = (corner_mip_level(camera, world, texel) + bias).max(0.0);
                        self.corner_memo.insert(key, l);
                        l
                    }
                };
                min_level = min_level.min(corner_level);
                max_level = max_level.max(corner_level);
            }

            // Tiles straddling the frustum edge get full resolution to avoid
            // popping as the camera sweeps across them
            if (1..=3).contains(&visible_corners) {
                min_level = 0.0;
            }

            if level > 0 && min_level < level as f32 {
                let child_grid = seq.tile_grid_at(level - 1);
                let base = tile * 2;
                for dy in 0..2 {
                    for dx in 0..2 {
                        let child = base + IVec2::new(dx, dy);
                        if child.x < child_grid.x as i32 && child.y < child_grid.y as i32 {
                            queue.push_back((child, level - 1));
                        }
                    }
                }
            }

            if max_level >= level as f32 {
                plan[level as usize].include(tile);
            }
        }
    }

    // ===== Spherical strategy =====

    /// Lat-long sphere: corner point tests at mip 0, conservative downscale
    /// for the coarser levels.
    fn plan_spherical(
        &mut self,
        cameras: &[CameraInfo],
        transform: &Mat4,
        seq: &SequenceInfo,
        plan: &mut TilePlan,
    ) {
        let grid = seq.tile_grid;
        let mut sel0 = TileSelection::EMPTY;

        let frusta: Vec<Frustum> = cameras
            .iter()
            .map(|c| Frustum::from_view_projection(&c.view_projection))
            .collect();

        for j in 0..=grid.y {
            for i in 0..=grid.x {
                let u = i as f32 / grid.x as f32;
                let v = j as f32 / grid.y as f32;
                let world = transform.transform_point3(latlong_to_cartesian(u, v));

                if frusta.iter().any(|f| f.point_visible(world)) {
                    // The four lattice tiles sharing this corner
                    for (dx, dy) in [(-1i32, -1i32), (0, -1), (-1, 0), (0, 0)] {
                        let tile = IVec2::new(i as i32 + dx, j as i32 + dy);
                        if tile.x >= 0
                            && tile.y >= 0
                            && tile.x < grid.x as i32
                            && tile.y < grid.y as i32
                        {
                            sel0.include(tile);
                        }
                    }
                }
            }
        }

        if !sel0.is_visible() {
            return;
        }

        plan[0] = plan[0].union(&sel0);
        for level in 1..seq.num_mip_levels {
            let scaled = sel0.scaled_down(level);
            plan[level as usize] = plan[level as usize].union(&scaled);
        }
    }
}

/// Mip level implied by one texel's screen-space footprint at `world`.
///
/// Projects the point and a one-texel offset; level ≈ max(0, 0.5·log2(1/Δ²))
/// where Δ is the screen-space distance in pixels. A corner behind the camera
/// reports "maximally coarse" and is handled by the frustum tests instead.
fn corner_mip_level(camera: &CameraInfo, world: Vec3, texel: f32) -> f32 {
    let a = project_to_screen(camera, world);
    let b = project_to_screen(camera, world + Vec3::new(texel, 0.0, 0.0));
    let (Some(a), Some(b)) = (a, b) else {
        return f32::MAX;
    };

    let delta_sq = a.distance_squared(b);
    if delta_sq <= f32::EPSILON {
        return f32::MAX;
    }
    (0.5 * (1.0 / delta_sq).log2()).max(0.0)
}

fn project_to_screen(camera: &CameraInfo, world: Vec3) -> Option<Vec2> {
    let clip = camera.view_projection * world.extend(1.0);
    if clip.w <= f32::EPSILON {
        return None;
    }
    let ndc = clip.xy() / clip.w;
    Some(ndc * 0.5 * camera.viewport)
}

/// Map lat-long texture coordinates to a point on the unit sphere.
/// u wraps longitude [0, 2π); v spans latitude [-π/2, π/2].
fn latlong_to_cartesian(u: f32, v: f32) -> Vec3 {
    let lon = u * std::f32::consts::TAU;
    let lat = (v - 0.5) * std::f32::consts::PI;
    Vec3::new(
        lat.cos() * lon.sin(),
        lat.sin(),
        lat.cos() * lon.cos(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_seq(mips: u32) -> SequenceInfo {
        SequenceInfo {
            name: "plate".to_string(),
            dim: UVec2::new(4096, 4096),
            tile_grid: UVec2::new(8, 8),
            num_mip_levels: mips,
        }
    }

    /// Camera at `distance` on +Z looking at the origin, 60 degree fov
    fn camera_at(distance: f32) -> CameraInfo {
        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.01, 10_000.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, distance), Vec3::ZERO, Vec3::Y);
        CameraInfo {
            location: Vec3::new(0.0, 0.0, distance),
            view_projection: proj * view,
            viewport: Vec2::new(1920.0, 1080.0),
            mip_bias: 0.0,
        }
    }

    #[test]
    fn test_selection_rect_basics() {
        let mut sel = TileSelection::EMPTY;
        assert!(!sel.is_visible());
        assert_eq!(sel.num_tiles(), 0);

        sel.include(IVec2::new(2, 3));
        sel.include(IVec2::new(4, 1));
        assert!(sel.is_visible());
        assert_eq!(sel.top_left, IVec2::new(2, 1));
        assert_eq!(sel.bottom_right, IVec2::new(5, 4));
        assert!(sel.contains(IVec2::new(3, 2)));
        assert!(!sel.contains(IVec2::new(5, 2)));
    }

    #[test]
    fn test_selection_scaled_down_rounds_outward() {
        let sel = TileSelection {
            top_left: IVec2::new(3, 1),
            bottom_right: IVec2::new(7, 6),
        };
        let s1 = sel.scaled_down(1);
        assert_eq!(s1.top_left, IVec2::new(1, 0));
        assert_eq!(s1.bottom_right, IVec2::new(4, 3));
    }

    #[test]
    fn test_tile_grid_at_rounds_up() {
        let seq = SequenceInfo {
            name: "plate".to_string(),
            dim: UVec2::new(2048, 1280),
            tile_grid: UVec2::new(8, 5),
            num_mip_levels: 4,
        };
        assert_eq!(seq.tile_grid_at(0), UVec2::new(8, 5));
        assert_eq!(seq.tile_grid_at(1), UVec2::new(4, 3));
        assert_eq!(seq.tile_grid_at(2), UVec2::new(2, 2));
        assert_eq!(seq.tile_grid_at(3), UVec2::new(1, 1));
    }

    #[test]
    fn test_planar_covers_odd_grid_bottom_row() {
        // 8x5 grid: the last row exists only as a partial tile row, and the
        // quadtree must still descend into it
        let mut info = MipTileInfo::new();
        info.register_target(Uuid::new_v4(), 1.0, 0.0, TargetStrategy::Planar);

        let seq = SequenceInfo {
            name: "plate".to_string(),
            dim: UVec2::new(2048, 1280),
            tile_grid: UVec2::new(8, 5),
            num_mip_levels: 2,
        };
        // Whole plate in view, close enough to demand mip 0 everywhere
        let mut cam = camera_at(1.0);
        cam.viewport = Vec2::new(10_000.0, 10_000.0);

        let plan = info.calculate_visible_tiles(&[cam], &seq);
        assert_eq!(
            plan[0],
            TileSelection {
                top_left: IVec2::ZERO,
                bottom_right: IVec2::new(8, 5),
            }
        );
    }

    #[test]
    fn test_negative_bias_keeps_mip0_tiles() {
        // A strongly negative bias saturates at full resolution instead of
        // pushing tiles below level 0 and out of the plan
        let mut info = MipTileInfo::new();
        info.register_target(Uuid::new_v4(), 1.0, -3.0, TargetStrategy::Planar);

        let mut cam = camera_at(1.0);
        cam.viewport = Vec2::new(10_000.0, 10_000.0);

        let plan = info.calculate_visible_tiles(&[cam], &test_seq(2));
        assert!(plan[0].is_visible());
    }

    #[test]
    fn test_no_targets_yields_empty_plan() {
        let mut info = MipTileInfo::new();
        let plan = info.calculate_visible_tiles(&[camera_at(2.0)], &test_seq(4));
        assert!(plan.iter().all(|s| !s.is_visible()));
    }

    #[test]
    fn test_planar_far_camera_coarsest_only() {
        // The camera is so far away that no corner requires
        // anything finer than the coarsest mip
        let mut info = MipTileInfo::new();
        info.register_target(Uuid::new_v4(), 1.0, 0.0, TargetStrategy::Planar);

        let seq = test_seq(4);
        let plan = info.calculate_visible_tiles(&[camera_at(5000.0)], &seq);

        let coarsest = (seq.num_mip_levels - 1) as usize;
        assert!(plan[coarsest].is_visible());
        assert_eq!(plan[coarsest].num_tiles(), 1);
        for level in 0..coarsest {
            assert!(!plan[level].is_visible(), "level {} unexpectedly visible", level);
        }
    }

    #[test]
    fn test_planar_near_camera_reaches_mip0() {
        let mut info = MipTileInfo::new();
        info.register_target(Uuid::new_v4(), 10.0, 0.0, TargetStrategy::Planar);

        let plan = info.calculate_visible_tiles(&[camera_at(0.5)], &test_seq(4));
        assert!(plan[0].is_visible());
    }

    #[test]
    fn test_planar_behind_camera_invisible() {
        let mut info = MipTileInfo::new();
        info.register_target(Uuid::new_v4(), 1.0, 0.0, TargetStrategy::Planar);

        let mut cam = camera_at(2.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 2.0), Vec3::new(0.0, 0.0, 4.0), Vec3::Y);
        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.01, 10_000.0);
        cam.view_projection = proj * view;

        let plan = info.calculate_visible_tiles(&[cam], &test_seq(4));
        assert!(plan.iter().all(|s| !s.is_visible()));
    }

    #[test]
    fn test_plan_determinism() {
        let mut info = MipTileInfo::new();
        info.register_target(Uuid::new_v4(), 2.0, 0.5, TargetStrategy::Planar);
        info.register_target(
            Uuid::new_v4(),
            1.0,
            0.0,
            TargetStrategy::Spherical {
                transform: Mat4::from_scale(Vec3::splat(3.0)),
            },
        );

        let cams = [camera_at(1.5), camera_at(4.0)];
        let seq = test_seq(4);
        let a = info.calculate_visible_tiles(&cams, &seq);
        let b = info.calculate_visible_tiles(&cams, &seq);
        assert_eq!(a, b);
    }

    #[test]
    fn test_spherical_downscale_superset() {
        let mut info = MipTileInfo::new();
        info.register_target(
            Uuid::new_v4(),
            1.0,
            0.0,
            TargetStrategy::Spherical {
                transform: Mat4::IDENTITY,
            },
        );

        let seq = test_seq(4);
        // Camera inside the unit sphere, looking out through its surface
        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.01, 100.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 0.2), Vec3::new(0.0, 0.0, 2.0), Vec3::Y);
        let cam = CameraInfo {
            location: Vec3::new(0.0, 0.0, 0.2),
            view_projection: proj * view,
            viewport: Vec2::new(1920.0, 1080.0),
            mip_bias: 0.0,
        };
        let plan = info.calculate_visible_tiles(&[cam], &seq);

        assert!(plan[0].is_visible());
        {
            for level in 1..seq.num_mip_levels {
                let expect = plan[0].scaled_down(level);
                let got = plan[level as usize];
                assert!(got.top_left.x <= expect.top_left.x);
                assert!(got.top_left.y <= expect.top_left.y);
                assert!(got.bottom_right.x >= expect.bottom_right.x);
                assert!(got.bottom_right.y >= expect.bottom_right.y);
            }
        }
    }

    #[test]
    fn test_unregister_target() {
        let mut info = MipTileInfo::new();
        let handle = Uuid::new_v4();
        info.register_target(handle, 1.0, 0.0, TargetStrategy::Planar);
        assert!(info.has_targets());

        info.unregister_target(&handle);
        assert!(!info.has_targets());

        let plan = info.calculate_visible_tiles(&[camera_at(2.0)], &test_seq(4));
        assert!(plan.iter().all(|s| !s.is_visible()));
    }
}
