//! Planar geometry model and its canonical WKT serialization.
//!
//! The WKT produced by [`Geometry::to_wkt`] is the hash input for feature
//! identities, so its formatting is part of the identity contract:
//! coordinates use Rust's shortest round-trip `f64` formatting, one space
//! between ordinates, `", "` between vertices.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// A 2D coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// A closed sequence of coordinates (first == last once repaired).
pub type Ring = Vec<Coord>;

/// Supported geometry kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(Coord),
    LineString(Vec<Coord>),
    /// Exterior ring followed by interior rings.
    Polygon(Vec<Ring>),
    MultiPolygon(Vec<Vec<Ring>>),
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    fn from_coord(c: Coord) -> Self {
        Self {
            min_x: c.x,
            min_y: c.y,
            max_x: c.x,
            max_y: c.y,
        }
    }

    fn expand(&mut self, c: Coord) {
        self.min_x = self.min_x.min(c.x);
        self.min_y = self.min_y.min(c.y);
        self.max_x = self.max_x.max(c.x);
        self.max_y = self.max_y.max(c.y);
    }

    pub fn merge(&mut self, other: &Envelope) {
        self.expand(Coord::new(other.min_x, other.min_y));
        self.expand(Coord::new(other.max_x, other.max_y));
    }
}

impl Geometry {
    pub fn kind(&self) -> &'static str {
        match self {
            Geometry::Point(_) => "Point",
            Geometry::LineString(_) => "LineString",
            Geometry::Polygon(_) => "Polygon",
            Geometry::MultiPolygon(_) => "MultiPolygon",
        }
    }

    /// Every vertex of the geometry in serialization order.
    pub fn coords(&self) -> Box<dyn Iterator<Item = Coord> + '_> {
        match self {
            Geometry::Point(c) => Box::new(std::iter::once(*c)),
            Geometry::LineString(line) => Box::new(line.iter().copied()),
            Geometry::Polygon(rings) => Box::new(rings.iter().flatten().copied()),
            Geometry::MultiPolygon(polys) => {
                Box::new(polys.iter().flatten().flatten().copied())
            }
        }
    }

    pub fn envelope(&self) -> Option<Envelope> {
        let mut coords = self.coords();
        let mut env = Envelope::from_coord(coords.next()?);
        for c in coords {
            env.expand(c);
        }
        Some(env)
    }

    /// Apply `f` to every vertex, preserving structure.
    pub fn map_coords(&self, f: &impl Fn(Coord) -> Coord) -> Geometry {
        let ring = |r: &Ring| r.iter().map(|c| f(*c)).collect::<Ring>();
        match self {
            Geometry::Point(c) => Geometry::Point(f(*c)),
            Geometry::LineString(line) => Geometry::LineString(ring(line)),
            Geometry::Polygon(rings) => Geometry::Polygon(rings.iter().map(ring).collect()),
            Geometry::MultiPolygon(polys) => Geometry::MultiPolygon(
                polys
                    .iter()
                    .map(|rings| rings.iter().map(ring).collect())
                    .collect(),
            ),
        }
    }

    /// Even-odd point-in-polygon test. Always `false` for points and lines.
    pub fn contains(&self, p: Coord) -> bool {
        match self {
            Geometry::Polygon(rings) => polygon_contains(rings, p),
            Geometry::MultiPolygon(polys) => polys.iter().any(|rings| polygon_contains(rings, p)),
            Geometry::Point(_) | Geometry::LineString(_) => false,
        }
    }

    /// Canonical well-known-text serialization.
    pub fn to_wkt(&self) -> String {
        let mut out = String::new();
        match self {
            Geometry::Point(c) => {
                out.push_str("POINT (");
                push_coord(&mut out, *c);
                out.push(')');
            }
            Geometry::LineString(line) => {
                out.push_str("LINESTRING ");
                push_ring(&mut out, line);
            }
            Geometry::Polygon(rings) => {
                out.push_str("POLYGON ");
                push_rings(&mut out, rings);
            }
            Geometry::MultiPolygon(polys) => {
                out.push_str("MULTIPOLYGON (");
                for (i, rings) in polys.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    push_rings(&mut out, rings);
                }
                out.push(')');
            }
        }
        out
    }
}

fn push_coord(out: &mut String, c: Coord) {
    let _ = write!(out, "{} {}", c.x, c.y);
}

fn push_ring(out: &mut String, ring: &[Coord]) {
    out.push('(');
    for (i, c) in ring.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        push_coord(out, *c);
    }
    out.push(')');
}

fn push_rings(out: &mut String, rings: &[Ring]) {
    out.push('(');
    for (i, ring) in rings.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        push_ring(out, ring);
    }
    out.push(')');
}

fn polygon_contains(rings: &[Ring], p: Coord) -> bool {
    let mut inside = false;
    for ring in rings {
        if ring.len() < 2 {
            continue;
        }
        let mut j = ring.len() - 1;
        for i in 0..ring.len() {
            let (a, b) = (ring[i], ring[j]);
            if (a.y > p.y) != (b.y > p.y) && p.x < (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x {
                inside = !inside;
            }
            j = i;
        }
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: f64, y0: f64, size: f64) -> Ring {
        vec![
            Coord::new(x0, y0),
            Coord::new(x0 + size, y0),
            Coord::new(x0 + size, y0 + size),
            Coord::new(x0, y0 + size),
            Coord::new(x0, y0),
        ]
    }

    #[test]
    fn point_wkt() {
        assert_eq!(Geometry::Point(Coord::new(1.0, -2.5)).to_wkt(), "POINT (1 -2.5)");
    }

    #[test]
    fn polygon_with_hole_wkt() {
        let g = Geometry::Polygon(vec![square(0.0, 0.0, 10.0), square(2.0, 2.0, 1.0)]);
        assert_eq!(
            g.to_wkt(),
            "POLYGON ((0 0, 10 0, 10 10, 0 10, 0 0), (2 2, 3 2, 3 3, 2 3, 2 2))"
        );
    }

    #[test]
    fn multipolygon_wkt() {
        let g = Geometry::MultiPolygon(vec![vec![square(0.0, 0.0, 1.0)], vec![square(5.0, 5.0, 1.0)]]);
        assert!(g.to_wkt().starts_with("MULTIPOLYGON (((0 0, 1 0"));
        assert!(g.to_wkt().ends_with("5 5)))"));
    }

    #[test]
    fn hole_is_outside_polygon() {
        let g = Geometry::Polygon(vec![square(0.0, 0.0, 10.0), square(2.0, 2.0, 2.0)]);
        assert!(g.contains(Coord::new(1.0, 1.0)));
        assert!(!g.contains(Coord::new(3.0, 3.0)));
        assert!(!g.contains(Coord::new(11.0, 1.0)));
    }

    #[test]
    fn envelope_covers_all_parts() {
        let g = Geometry::MultiPolygon(vec![vec![square(0.0, 0.0, 1.0)], vec![square(5.0, 6.0, 1.0)]]);
        let env = g.envelope().unwrap();
        assert_eq!((env.min_x, env.min_y, env.max_x, env.max_y), (0.0, 0.0, 6.0, 7.0));
    }
}
