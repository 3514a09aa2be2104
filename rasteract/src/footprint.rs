//! Minimal stand-in for the external geospatial `Footprint` type.
//!
//! Spec §1 explicitly treats the real `Footprint` (affine-transform + pixel
//! grid, backed by a geospatial library) as an external collaborator. The
//! core only ever calls a handful of operations on it (equality under
//! tolerance, `same_grid`, `share_area`, `intersection`, `slice_in`, regular
//! tiling), so this module provides just those, over a simple axis-aligned
//! affine grid. It is not a georeferencing library.

const TOLERANCE: f64 = 1e-6;

/// The affine lattice a [`Footprint`] is defined on: an origin in world
/// coordinates plus a per-axis pixel size. `px_h` is conventionally negative
/// (north-up rasters), matching the teacher's coordinate convention of
/// north-up tile math in `coord::to_tile_coords`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineGrid {
    pub tl_x: f64,
    pub tl_y: f64,
    pub px_w: f64,
    pub px_h: f64,
}

impl AffineGrid {
    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= TOLERANCE
    }

    /// Whether `self` and `other` share the same pixel size and the same
    /// sub-pixel phase, i.e. any footprint on one grid can be expressed as
    /// an integer pixel slice of a footprint on the other.
    pub fn same_grid(&self, other: &AffineGrid) -> bool {
        if !Self::close(self.px_w, other.px_w) || !Self::close(self.px_h, other.px_h) {
            return false;
        }
        let dx = (self.tl_x - other.tl_x) / self.px_w;
        let dy = (self.tl_y - other.tl_y) / self.px_h;
        Self::close(dx, dx.round()) && Self::close(dy, dy.round())
    }
}

/// A rectangular region on an affine pixel grid.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Footprint {
    pub grid: AffineGrid,
    pub rsize: (u32, u32),
}

/// An integer pixel offset + size of one footprint inside a containing
/// one, returned by [`Footprint::slice_in`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelSlice {
    pub x0: u32,
    pub y0: u32,
    pub w: u32,
    pub h: u32,
}

impl Footprint {
    pub fn new(grid: AffineGrid, rsize: (u32, u32)) -> Self {
        Self { grid, rsize }
    }

    pub fn width(&self) -> u32 {
        self.rsize.0
    }

    pub fn height(&self) -> u32 {
        self.rsize.1
    }

    /// Footprint equality under floating-point tolerance (spec §3).
    pub fn fuzzy_eq(&self, other: &Footprint) -> bool {
        self.rsize == other.rsize
            && AffineGrid::close(self.grid.tl_x, other.grid.tl_x)
            && AffineGrid::close(self.grid.tl_y, other.grid.tl_y)
            && AffineGrid::close(self.grid.px_w, other.grid.px_w)
            && AffineGrid::close(self.grid.px_h, other.grid.px_h)
    }

    pub fn same_grid(&self, other: &Footprint) -> bool {
        self.grid.same_grid(&other.grid)
    }

    fn world_bounds(&self) -> (f64, f64, f64, f64) {
        let x0 = self.grid.tl_x;
        let y0 = self.grid.tl_y;
        let x1 = x0 + self.grid.px_w * self.rsize.0 as f64;
        let y1 = y0 + self.grid.px_h * self.rsize.1 as f64;
        (x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
    }

    /// Whether the two footprints' world-space bounding boxes overlap.
    pub fn share_area(&self, other: &Footprint) -> bool {
        let (ax0, ay0, ax1, ay1) = self.world_bounds();
        let (bx0, by0, bx1, by1) = other.world_bounds();
        ax0 < bx1 && bx0 < ax1 && ay0 < by1 && by0 < ay1
    }

    /// The overlapping region of `self` and `other`, expressed on `self`'s
    /// grid, or `None` if they don't overlap. Both inputs must share a grid.
    pub fn intersection(&self, other: &Footprint) -> Option<Footprint> {
        if !self.same_grid(other) || !self.share_area(other) {
            return None;
        }
        let (ax0, ay0, ax1, ay1) = self.world_bounds();
        let (bx0, by0, bx1, by1) = other.world_bounds();
        let x0 = ax0.max(bx0);
        let y0 = ay0.max(by0);
        let x1 = ax1.min(bx1);
        let y1 = ay1.min(by1);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        let px_w = self.grid.px_w.abs();
        let px_h = self.grid.px_h.abs();
        let w = ((x1 - x0) / px_w).round() as u32;
        let h = ((y1 - y0) / px_h).round() as u32;
        if w == 0 || h == 0 {
            return None;
        }
        let tl_x = if self.grid.px_w >= 0.0 { x0 } else { x1 };
        let tl_y = if self.grid.px_h >= 0.0 { y0 } else { y1 };
        Some(Footprint::new(
            AffineGrid {
                tl_x,
                tl_y,
                px_w: self.grid.px_w,
                px_h: self.grid.px_h,
            },
            (w, h),
        ))
    }

    /// The integer pixel slice of `self` inside `parent`, when `self` is
    /// grid-aligned with and fully contained in `parent`.
    pub fn slice_in(&self, parent: &Footprint) -> Option<PixelSlice> {
        if !self.same_grid(parent) {
            return None;
        }
        let dx = (self.grid.tl_x - parent.grid.tl_x) / parent.grid.px_w;
        let dy = (self.grid.tl_y - parent.grid.tl_y) / parent.grid.px_h;
        let x0 = dx.round();
        let y0 = dy.round();
        if x0 < 0.0 || y0 < 0.0 {
            return None;
        }
        let (x0, y0) = (x0 as u32, y0 as u32);
        if x0 as u64 + self.rsize.0 as u64 > parent.rsize.0 as u64
            || y0 as u64 + self.rsize.1 as u64 > parent.rsize.1 as u64
        {
            return None;
        }
        Some(PixelSlice {
            x0,
            y0,
            w: self.rsize.0,
            h: self.rsize.1,
        })
    }

    /// Regular subdivision into tiles of at most `tile_w` x `tile_h` pixels,
    /// row-major, edge tiles clipped to the remaining size.
    pub fn tile(&self, tile_w: u32, tile_h: u32) -> Vec<Footprint> {
        let tile_w = tile_w.max(1);
        let tile_h = tile_h.max(1);
        let mut out = Vec::new();
        let mut y = 0u32;
        while y < self.rsize.1 {
            let h = tile_h.min(self.rsize.1 - y);
            let mut x = 0u32;
            while x < self.rsize.0 {
                let w = tile_w.min(self.rsize.0 - x);
                let tl_x = self.grid.tl_x + self.grid.px_w * x as f64;
                let tl_y = self.grid.tl_y + self.grid.px_h * y as f64;
                out.push(Footprint::new(
                    AffineGrid {
                        tl_x,
                        tl_y,
                        px_w: self.grid.px_w,
                        px_h: self.grid.px_h,
                    },
                    (w, h),
                ));
                x += w;
            }
            y += h;
        }
        out
    }

    /// A stable tiebreak key for urgency ordering (spec §4.2): row-major
    /// pixel offset from a conceptual (0,0) origin on this footprint's own
    /// grid, derived from its world-space top-left.
    pub fn tiebreak_key(&self) -> (i64, i64) {
        let col = (self.grid.tl_x / self.grid.px_w.abs().max(f64::EPSILON)).round() as i64;
        let row = (self.grid.tl_y / self.grid.px_h.abs().max(f64::EPSILON)).round() as i64;
        (row, col)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(tl_x: f64, tl_y: f64) -> AffineGrid {
        AffineGrid {
            tl_x,
            tl_y,
            px_w: 1.0,
            px_h: -1.0,
        }
    }

    #[test]
    fn same_grid_requires_integer_phase() {
        let a = Footprint::new(grid(0.0, 0.0), (10, 10));
        let b = Footprint::new(grid(3.0, -2.0), (4, 4));
        let c = Footprint::new(grid(3.5, -2.0), (4, 4));
        assert!(a.same_grid(&b));
        assert!(!a.same_grid(&c));
    }

    #[test]
    fn slice_in_computes_pixel_offset() {
        let parent = Footprint::new(grid(0.0, 0.0), (10, 10));
        let child = Footprint::new(grid(3.0, -2.0), (4, 4));
        assert_eq!(
            child.slice_in(&parent),
            Some(PixelSlice {
                x0: 3,
                y0: 2,
                w: 4,
                h: 4
            })
        );
    }

    #[test]
    fn slice_in_rejects_out_of_bounds() {
        let parent = Footprint::new(grid(0.0, 0.0), (10, 10));
        let child = Footprint::new(grid(8.0, -2.0), (4, 4));
        assert_eq!(child.slice_in(&parent), None);
    }

    #[test]
    fn intersection_of_disjoint_is_none() {
        let a = Footprint::new(grid(0.0, 0.0), (4, 4));
        let b = Footprint::new(grid(10.0, -10.0), (4, 4));
        assert!(a.intersection(&b).is_none());
    }

    #[test]
    fn tile_covers_whole_area_with_clipped_edges() {
        let fp = Footprint::new(grid(0.0, 0.0), (10, 10));
        let tiles = fp.tile(4, 4);
        assert_eq!(tiles.len(), 9);
        let total: u64 = tiles
            .iter()
            .map(|t| t.width() as u64 * t.height() as u64)
            .sum();
        assert_eq!(total, 100);
    }
}
