//! Polygon tracing: extract polygons from a binary mask block.
//!
//! This module defines the [`PolygonTracer`] trait for pluggable tracing
//! algorithms and the [`TracerKind`] enum for selecting which algorithm
//! to use from configuration.
//!
//! # Pixel-edge tracing
//!
//! [`TracerKind::PixelEdges`] walks the boundary between foreground and
//! background pixels along pixel edges, so a single pixel becomes a unit
//! square and traced areas equal pixel counts times pixel area. Regions
//! are 4-connected: two pixels touching only at a corner belong to
//! different polygons. Every directed boundary edge keeps the foreground
//! on its right (in row-down pixel space), which makes outer rings and
//! hole rings distinguishable by the sign of their shoelace area.
//!
//! Rings are traced in pixel-corner coordinates and mapped to world space
//! through the block's own affine transform at the end.

use std::collections::HashMap;

use geo::orient::{Direction, Orient};
use geo::{Contains, Coord, LineString, Point, Polygon};
use serde::{Deserialize, Serialize};

use crate::grid::Block;
use crate::types::GeoTransform;

/// Selects which polygon tracing algorithm to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TracerKind {
    /// 4-connected boundary following along pixel edges.
    #[default]
    PixelEdges,
}

/// Trait for polygon tracing strategies.
///
/// Input: a mask block (non-zero = foreground) and the block's affine
/// transform. Output: one polygon per connected foreground region, in
/// world coordinates, with holes attached.
pub trait PolygonTracer {
    /// Trace the foreground regions of `mask`.
    fn trace(&self, mask: &Block<u8>, transform: &GeoTransform) -> Vec<Polygon<f64>>;
}

impl PolygonTracer for TracerKind {
    fn trace(&self, mask: &Block<u8>, transform: &GeoTransform) -> Vec<Polygon<f64>> {
        match *self {
            Self::PixelEdges => trace_pixel_edges(mask, transform),
        }
    }
}

// ---------------------------------------------------------------------------
// Edge directions
// ---------------------------------------------------------------------------

/// Direction bit flags stored per pixel corner.
const EAST: u8 = 1;
const SOUTH: u8 = 2;
const WEST: u8 = 4;
const NORTH: u8 = 8;

/// Direction after turning right (toward the foreground) from `dir`.
const fn turn_right(dir: u8) -> u8 {
    match dir {
        EAST => SOUTH,
        SOUTH => WEST,
        WEST => NORTH,
        _ => EAST,
    }
}

/// Corner reached by stepping from `(x, y)` along `dir`.
const fn step(x: u32, y: u32, dir: u8) -> (u32, u32) {
    match dir {
        EAST => (x + 1, y),
        SOUTH => (x, y + 1),
        WEST => (x - 1, y),
        _ => (x, y - 1),
    }
}

/// Outgoing boundary edges of every pixel corner of a mask.
struct EdgeMap {
    /// Corners per row (`mask width + 1`).
    stride: u32,
    /// One direction bitset per corner, row-major.
    out: Vec<u8>,
}

impl EdgeMap {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn build(mask: &Block<u8>) -> Self {
        let (width, height) = mask.dimensions();
        let stride = width + 1;
        let mut out = vec![0u8; stride as usize * (height as usize + 1)];
        let is_fg = |col: i64, row: i64| {
            col >= 0
                && row >= 0
                && col < i64::from(width)
                && row < i64::from(height)
                && mask.get_pixel(col as u32, row as u32)[0] != 0
        };
        let idx = |x: u32, y: u32| (y * stride + x) as usize;

        for row in 0..height {
            for col in 0..width {
                if mask.get_pixel(col, row)[0] == 0 {
                    continue;
                }
                let (c, r) = (i64::from(col), i64::from(row));
                if !is_fg(c, r - 1) {
                    out[idx(col, row)] |= EAST;
                }
                if !is_fg(c + 1, r) {
                    out[idx(col + 1, row)] |= SOUTH;
                }
                if !is_fg(c, r + 1) {
                    out[idx(col + 1, row + 1)] |= WEST;
                }
                if !is_fg(c - 1, r) {
                    out[idx(col, row + 1)] |= NORTH;
                }
            }
        }
        Self { stride, out }
    }

    const fn index(&self, x: u32, y: u32) -> usize {
        (y * self.stride + x) as usize
    }

    /// Pick the next edge leaving `(x, y)` after arriving along `incoming`.
    /// At a saddle corner the right turn keeps the current pixel's region
    /// separate from its diagonal neighbour.
    fn next(&self, x: u32, y: u32, incoming: u8) -> Option<u8> {
        let bits = self.out[self.index(x, y)];
        if bits == 0 {
            return None;
        }
        let right = turn_right(incoming);
        if bits & right != 0 {
            return Some(right);
        }
        Some(1 << bits.trailing_zeros())
    }

    /// Follow one closed ring starting with the edge `(x, y, dir)`.
    /// Consumes the edges it walks.
    fn walk(&mut self, x: u32, y: u32, dir: u8) -> Vec<(u32, u32)> {
        let start = (x, y, dir);
        let mut ring = vec![(x, y)];
        let (mut cx, mut cy, mut cdir) = start;
        loop {
            let i = self.index(cx, cy);
            self.out[i] &= !cdir;
            let (nx, ny) = step(cx, cy, cdir);
            let Some(ndir) = self.next_or_start(nx, ny, cdir, start) else {
                break;
            };
            if (nx, ny, ndir) == start {
                break;
            }
            ring.push((nx, ny));
            (cx, cy, cdir) = (nx, ny, ndir);
        }
        ring
    }

    /// Like [`next`](Self::next) but also considers the already consumed
    /// start edge so the ring can close on it.
    fn next_or_start(&self, x: u32, y: u32, incoming: u8, start: (u32, u32, u8)) -> Option<u8> {
        if (x, y) == (start.0, start.1) {
            let right = turn_right(incoming);
            if right == start.2 {
                return Some(start.2);
            }
            let bits = self.out[self.index(x, y)];
            if bits & right != 0 {
                return Some(right);
            }
            return if bits == 0 {
                Some(start.2)
            } else {
                Some(1 << bits.trailing_zeros())
            };
        }
        self.next(x, y, incoming)
    }
}

// ---------------------------------------------------------------------------
// Ring assembly
// ---------------------------------------------------------------------------

/// Split a walked boundary at corners it passes twice.
///
/// Saddle corners keep diagonal foreground pixels apart, so a boundary
/// can touch itself there. Cutting it into simple rings leaves shells and
/// holes that meet at a single point instead.
fn split_at_touches(ring: Vec<(u32, u32)>) -> Vec<Vec<(u32, u32)>> {
    let mut rings = Vec::new();
    let mut path: Vec<(u32, u32)> = Vec::with_capacity(ring.len());
    let mut seen: HashMap<(u32, u32), usize> = HashMap::new();
    for corner in ring {
        if let Some(&at) = seen.get(&corner) {
            let tail: Vec<(u32, u32)> = path.drain(at + 1..).collect();
            for c in &tail {
                seen.remove(c);
            }
            let mut sub = Vec::with_capacity(tail.len() + 1);
            sub.push(corner);
            sub.extend(tail);
            rings.push(sub);
        } else {
            seen.insert(corner, path.len());
            path.push(corner);
        }
    }
    rings.push(path);
    rings
}

/// Drop corners that lie on a straight run between their neighbours.
fn remove_collinear(ring: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let n = ring.len();
    if n < 4 {
        return ring.to_vec();
    }
    (0..n)
        .filter(|&i| {
            let (px, py) = ring[(i + n - 1) % n];
            let (x, y) = ring[i];
            let (nx, ny) = ring[(i + 1) % n];
            let cross = (i64::from(x) - i64::from(px)) * (i64::from(ny) - i64::from(y))
                - (i64::from(y) - i64::from(py)) * (i64::from(nx) - i64::from(x));
            cross != 0
        })
        .map(|i| ring[i])
        .collect()
}

/// Twice the signed shoelace area of a ring in pixel-corner space.
/// Positive for outer rings, negative for holes.
fn signed_area2(ring: &[(u32, u32)]) -> i64 {
    let n = ring.len();
    (0..n)
        .map(|i| {
            let (x0, y0) = ring[i];
            let (x1, y1) = ring[(i + 1) % n];
            i64::from(x0) * i64::from(y1) - i64::from(x1) * i64::from(y0)
        })
        .sum()
}

/// A point strictly inside the foreground pixel to the right of the
/// ring's first edge.
fn foreground_probe(ring: &[(u32, u32)]) -> Point<f64> {
    let (x0, y0) = ring[0];
    let (x1, y1) = ring[1 % ring.len()];
    let (dx, dy) = (f64::from(x1) - f64::from(x0), f64::from(y1) - f64::from(y0));
    let len = dx.hypot(dy).max(f64::EPSILON);
    let (ux, uy) = (dx / len, dy / len);
    // Right of travel in row-down space is (-uy, ux). Stay near the start
    // corner so the probe lands in the first edge's own pixel.
    Point::new(
        f64::from(x0) + 0.5f64.mul_add(ux, -0.25 * uy),
        f64::from(y0) + 0.5f64.mul_add(uy, 0.25 * ux),
    )
}

fn to_line_string(ring: &[(u32, u32)], map: impl Fn(f64, f64) -> Coord<f64>) -> LineString<f64> {
    let mut coords: Vec<Coord<f64>> = ring
        .iter()
        .map(|&(x, y)| map(f64::from(x), f64::from(y)))
        .collect();
    if let Some(&first) = coords.first() {
        coords.push(first);
    }
    LineString::new(coords)
}

/// 4-connected pixel-edge tracing of every foreground region.
fn trace_pixel_edges(mask: &Block<u8>, transform: &GeoTransform) -> Vec<Polygon<f64>> {
    let mut edges = EdgeMap::build(mask);
    let (width, height) = mask.dimensions();

    let mut outers: Vec<Vec<(u32, u32)>> = Vec::new();
    let mut holes: Vec<Vec<(u32, u32)>> = Vec::new();
    for y in 0..=height {
        for x in 0..=width {
            while let Some(dir) = {
                let bits = edges.out[edges.index(x, y)];
                (bits != 0).then(|| 1 << bits.trailing_zeros())
            } {
                for ring in split_at_touches(edges.walk(x, y, dir)) {
                    let ring = remove_collinear(&ring);
                    if ring.len() < 4 {
                        continue;
                    }
                    if signed_area2(&ring) > 0 {
                        outers.push(ring);
                    } else {
                        holes.push(ring);
                    }
                }
            }
        }
    }

    let pixel_space: Vec<Polygon<f64>> = outers
        .iter()
        .map(|r| Polygon::new(to_line_string(r, |x, y| Coord { x, y }), vec![]))
        .collect();
    let mut assigned: Vec<Vec<usize>> = vec![Vec::new(); outers.len()];
    for (h, hole) in holes.iter().enumerate() {
        let probe = foreground_probe(hole);
        let owner = pixel_space
            .iter()
            .enumerate()
            .filter(|(_, outer)| outer.contains(&probe))
            .min_by_key(|(i, _)| signed_area2(&outers[*i]))
            .map(|(i, _)| i);
        if let Some(owner) = owner {
            assigned[owner].push(h);
        }
    }

    let world = |x: f64, y: f64| transform.apply(x, y);
    outers
        .iter()
        .zip(&assigned)
        .map(|(outer, hole_ids)| {
            let interiors = hole_ids
                .iter()
                .map(|&h| to_line_string(&holes[h], world))
                .collect();
            Polygon::new(to_line_string(outer, world), interiors).orient(Direction::Default)
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use geo::Area;
    use image::Luma;

    use super::*;

    fn unit_transform() -> GeoTransform {
        GeoTransform::north_up(0.0, 0.0, 1.0, 1.0)
    }

    fn mask_from(rows: &[&str]) -> Block<u8> {
        let height = u32::try_from(rows.len()).unwrap();
        let width = u32::try_from(rows[0].len()).unwrap();
        Block::from_fn(width, height, |c, r| {
            Luma([u8::from(rows[r as usize].as_bytes()[c as usize] == b'#')])
        })
    }

    fn trace(rows: &[&str]) -> Vec<Polygon<f64>> {
        TracerKind::PixelEdges.trace(&mask_from(rows), &unit_transform())
    }

    #[test]
    fn default_is_pixel_edges() {
        assert_eq!(TracerKind::default(), TracerKind::PixelEdges);
    }

    #[test]
    fn empty_mask_produces_no_polygons() {
        let mask = Block::new(10, 10);
        assert!(TracerKind::PixelEdges.trace(&mask, &unit_transform()).is_empty());
    }

    #[test]
    fn single_pixel_is_unit_square() {
        let polys = trace(&["...", ".#.", "..."]);
        assert_eq!(polys.len(), 1);
        assert_eq!(polys[0].exterior().0.len(), 5);
        assert!((polys[0].unsigned_area() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn rectangle_has_four_corners() {
        let polys = trace(&["......", ".####.", ".####.", "......"]);
        assert_eq!(polys.len(), 1);
        assert_eq!(polys[0].exterior().0.len(), 5);
        assert!((polys[0].unsigned_area() - 8.0).abs() < 1e-12);
    }

    #[test]
    fn region_touching_block_edge_is_closed() {
        let polys = trace(&["##", "##"]);
        assert_eq!(polys.len(), 1);
        assert!((polys[0].unsigned_area() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn area_equals_pixel_count() {
        let rows = [".##...#", "###..##", "..#####", "#......", "##.##.."];
        let count: usize = rows.iter().map(|r| r.matches('#').count()).sum();
        let total: f64 = trace(&rows).iter().map(Area::unsigned_area).sum();
        #[allow(clippy::cast_precision_loss)]
        let expected = count as f64;
        assert!((total - expected).abs() < 1e-9, "{total} vs {expected}");
    }

    #[test]
    fn diagonal_pixels_are_separate_regions() {
        let polys = trace(&["#.", ".#"]);
        assert_eq!(polys.len(), 2);
        for p in &polys {
            assert!((p.unsigned_area() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn ring_with_hole() {
        let polys = trace(&["#####", "#...#", "#...#", "#####"]);
        assert_eq!(polys.len(), 1);
        assert_eq!(polys[0].interiors().len(), 1);
        assert!((polys[0].unsigned_area() - 14.0).abs() < 1e-12);
    }

    #[test]
    fn island_inside_hole_is_its_own_polygon() {
        let polys = trace(&[
            "#######", "#.....#", "#.###.#", "#.###.#", "#.....#", "#######",
        ]);
        assert_eq!(polys.len(), 2);
        let holed: Vec<_> = polys.iter().filter(|p| !p.interiors().is_empty()).collect();
        assert_eq!(holed.len(), 1);
        assert_eq!(holed[0].interiors().len(), 1);
        let total: f64 = polys.iter().map(Area::unsigned_area).sum();
        assert!((total - (22.0 + 6.0)).abs() < 1e-9);
    }

    #[test]
    fn holes_meeting_at_a_corner_stay_separate() {
        let polys = trace(&["#####", "#.#.#", "##..#", "#...#", "#####"]);
        assert_eq!(polys.len(), 1);
        assert_eq!(polys[0].interiors().len(), 2);
        assert!((polys[0].unsigned_area() - 18.0).abs() < 1e-9);
    }

    #[test]
    fn shell_touching_itself_gets_a_hole() {
        // The loop closes only through a diagonal contact at the top right.
        let polys = trace(&["###..", "#..#.", "#..#.", "####."]);
        assert_eq!(polys.len(), 1);
        assert_eq!(polys[0].interiors().len(), 1);
        assert!((polys[0].unsigned_area() - 11.0).abs() < 1e-9);
    }

    #[test]
    fn split_at_touches_cuts_figure_eight() {
        let ring = vec![(0, 0), (1, 0), (1, 1), (2, 1), (2, 2), (1, 2), (1, 1), (0, 1)];
        let mut rings = split_at_touches(ring);
        rings.sort_by_key(Vec::len);
        assert_eq!(rings.len(), 2);
        assert_eq!(rings[0].len(), 4);
        assert_eq!(rings[1].len(), 4);
    }

    #[test]
    fn transform_places_polygon_in_world() {
        let mask = mask_from(&["#"]);
        let t = GeoTransform::north_up(1000.0, 5000.0, 2.0, 2.0);
        let polys = TracerKind::PixelEdges.trace(&mask, &t);
        assert_eq!(polys.len(), 1);
        let rect = geo::BoundingRect::bounding_rect(&polys[0]).unwrap();
        assert!((rect.min().x - 1000.0).abs() < 1e-9);
        assert!((rect.max().x - 1002.0).abs() < 1e-9);
        assert!((rect.min().y - 4998.0).abs() < 1e-9);
        assert!((rect.max().y - 5000.0).abs() < 1e-9);
        assert!((polys[0].unsigned_area() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn traced_polygons_are_valid() {
        let rows = ["..#..", ".###.", "#####", ".###.", "..#.."];
        for p in trace(&rows) {
            assert!(geo::Validation::is_valid(&p));
        }
    }
}
