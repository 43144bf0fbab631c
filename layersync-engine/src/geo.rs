//! Geoprocessing engine abstraction and the planar reference engine.
//!
//! [`PlanarEngine`] covers what the update pipeline needs without an
//! external GIS: geometry repair, WGS 84 ↔ Web Mercator projection and
//! Esri ASCII grid rasters.

use std::f64::consts::PI;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::debug;

use layersync_core::{Coord, Dataset, Envelope, Geometry, Ring, SpatialRef};

use crate::context::OpContext;
use crate::error::{engine_io, EngineError};

/// Grid definition of an existing raster.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterSpec {
    pub cell_size: f64,
    /// Lower-left corner; new rasters snap to this origin.
    pub origin: Coord,
    pub spatial_ref: SpatialRef,
}

pub trait GeoEngine {
    /// Repaired copy of `geometry`, or `None` when nothing valid remains.
    fn repair(&self, geometry: &Geometry) -> Option<Geometry>;

    /// Project `dataset` into `to`, using `ctx.transformation` when set.
    fn project(
        &self,
        ctx: &OpContext,
        dataset: &Dataset,
        to: &SpatialRef,
    ) -> Result<Dataset, EngineError>;

    /// Read the grid of the raster at `path`.
    fn describe_raster(&self, path: &Path, spatial_ref: &SpatialRef) -> Result<RasterSpec, EngineError>;

    /// Burn `value_field` of every polygon into a raster aligned to `grid`,
    /// written as `<out_dir>/<stem>.*`. Returns the files written.
    fn rasterize(
        &self,
        ctx: &OpContext,
        dataset: &Dataset,
        value_field: &str,
        grid: &RasterSpec,
        out_dir: &Path,
        stem: &str,
    ) -> Result<Vec<PathBuf>, EngineError>;
}

// ---------------------------------------------------------------------------
// Planar engine
// ---------------------------------------------------------------------------

const EARTH_RADIUS: f64 = 6_378_137.0;
const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;
pub const NODATA: i64 = -9999;

#[derive(Debug, Clone, Copy, Default)]
pub struct PlanarEngine;

impl PlanarEngine {
    pub fn new() -> Self {
        Self
    }
}

fn to_mercator(c: Coord) -> Coord {
    let lat = c.y.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
    Coord::new(
        EARTH_RADIUS * c.x.to_radians(),
        EARTH_RADIUS * (PI / 4.0 + lat / 2.0).tan().ln(),
    )
}

fn to_geographic(c: Coord) -> Coord {
    Coord::new(
        (c.x / EARTH_RADIUS).to_degrees(),
        (2.0 * (c.y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees(),
    )
}

/// Drop non-finite and repeated vertices.
fn clean_path(coords: &[Coord]) -> Vec<Coord> {
    let mut out: Vec<Coord> = Vec::with_capacity(coords.len());
    for c in coords.iter().copied().filter(Coord::is_finite) {
        if out.last() != Some(&c) {
            out.push(c);
        }
    }
    out
}

fn ring_area(ring: &[Coord]) -> f64 {
    ring.windows(2)
        .map(|w| w[0].x * w[1].y - w[1].x * w[0].y)
        .sum::<f64>()
        / 2.0
}

fn repair_ring(ring: &[Coord]) -> Option<Ring> {
    let mut out = clean_path(ring);
    if let (Some(first), Some(last)) = (out.first().copied(), out.last().copied()) {
        if first != last {
            out.push(first);
        }
    }
    (out.len() >= 4 && ring_area(&out) != 0.0).then_some(out)
}

fn repair_polygon(rings: &[Ring]) -> Option<Vec<Ring>> {
    let (exterior, holes) = rings.split_first()?;
    let mut out = vec![repair_ring(exterior)?];
    out.extend(holes.iter().filter_map(|h| repair_ring(h)));
    Some(out)
}

impl GeoEngine for PlanarEngine {
    fn repair(&self, geometry: &Geometry) -> Option<Geometry> {
        match geometry {
            Geometry::Point(c) => c.is_finite().then_some(Geometry::Point(*c)),
            Geometry::LineString(line) => {
                let line = clean_path(line);
                (line.len() >= 2).then_some(Geometry::LineString(line))
            }
            Geometry::Polygon(rings) => repair_polygon(rings).map(Geometry::Polygon),
            Geometry::MultiPolygon(polys) => {
                let polys: Vec<Vec<Ring>> =
                    polys.iter().filter_map(|p| repair_polygon(p)).collect();
                (!polys.is_empty()).then_some(Geometry::MultiPolygon(polys))
            }
        }
    }

    fn project(
        &self,
        ctx: &OpContext,
        dataset: &Dataset,
        to: &SpatialRef,
    ) -> Result<Dataset, EngineError> {
        let from = &dataset.spatial_ref;
        let f: fn(Coord) -> Coord = match (from.wkid, to.wkid) {
            (a, b) if a == b => return Ok(dataset.clone()),
            (SpatialRef::WGS84, SpatialRef::WEB_MERCATOR) => to_mercator,
            (SpatialRef::WEB_MERCATOR, SpatialRef::WGS84) => to_geographic,
            _ => {
                return Err(EngineError::UnsupportedProjection {
                    from: from.clone(),
                    to: to.clone(),
                })
            }
        };
        debug!(
            layer = %ctx.layer,
            from = from.wkid,
            to = to.wkid,
            transformation = ctx.transformation.as_deref().unwrap_or("none"),
            "projecting"
        );

        let mut out = dataset.clone();
        out.spatial_ref = to.clone();
        for feature in &mut out.features {
            if let Some(g) = &feature.geometry {
                feature.geometry = Some(g.map_coords(&f));
            }
        }
        Ok(out)
    }

    fn describe_raster(&self, path: &Path, spatial_ref: &SpatialRef) -> Result<RasterSpec, EngineError> {
        let text = std::fs::read_to_string(path).map_err(|e| engine_io(path, e))?;
        let header = |key: &str| -> Result<f64, EngineError> {
            text.lines()
                .filter_map(|l| l.split_once(char::is_whitespace))
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .and_then(|(_, v)| v.trim().parse::<f64>().ok())
                .ok_or_else(|| EngineError::RasterHeader {
                    path: path.to_path_buf(),
                    reason: format!("missing or invalid '{key}'"),
                })
        };
        let cell_size = header("cellsize")?;
        if cell_size <= 0.0 {
            return Err(EngineError::RasterHeader {
                path: path.to_path_buf(),
                reason: "cellsize must be positive".into(),
            });
        }
        Ok(RasterSpec {
            cell_size,
            origin: Coord::new(header("xllcorner")?, header("yllcorner")?),
            spatial_ref: spatial_ref.clone(),
        })
    }

    fn rasterize(
        &self,
        ctx: &OpContext,
        dataset: &Dataset,
        value_field: &str,
        grid: &RasterSpec,
        out_dir: &Path,
        stem: &str,
    ) -> Result<Vec<PathBuf>, EngineError> {
        let polygons: Vec<(&Geometry, i64)> = dataset
            .features
            .iter()
            .filter_map(|f| {
                let g = f.geometry.as_ref()?;
                matches!(g, Geometry::Polygon(_) | Geometry::MultiPolygon(_))
                    .then(|| (g, f.get(value_field).as_f64().map_or(NODATA, |v| v as i64)))
            })
            .collect();
        let envelope = polygons
            .iter()
            .filter_map(|(g, _)| g.envelope())
            .reduce(|mut a, b| {
                a.merge(&b);
                a
            })
            .ok_or_else(|| EngineError::Rasterize("no polygons to rasterize".into()))?;

        let (xmin, ymin, ncols, nrows) = snap(&envelope, grid);
        let cs = grid.cell_size;
        let ymax = ymin + nrows as f64 * cs;
        debug!(layer = %ctx.layer, ncols, nrows, "rasterizing");

        let mut body = String::new();
        let _ = writeln!(body, "ncols {ncols}");
        let _ = writeln!(body, "nrows {nrows}");
        let _ = writeln!(body, "xllcorner {xmin}");
        let _ = writeln!(body, "yllcorner {ymin}");
        let _ = writeln!(body, "cellsize {cs}");
        let _ = writeln!(body, "NODATA_value {NODATA}");
        for row in 0..nrows {
            let cy = ymax - (row as f64 + 0.5) * cs;
            let cells: Vec<String> = (0..ncols)
                .map(|col| {
                    let centre = Coord::new(xmin + (col as f64 + 0.5) * cs, cy);
                    polygons
                        .iter()
                        .find(|(g, _)| g.contains(centre))
                        .map_or(NODATA, |(_, v)| *v)
                        .to_string()
                })
                .collect();
            let _ = writeln!(body, "{}", cells.join(" "));
        }

        std::fs::create_dir_all(out_dir).map_err(|e| engine_io(out_dir, e))?;
        let asc = out_dir.join(format!("{stem}.asc"));
        let prj = out_dir.join(format!("{stem}.prj"));
        std::fs::write(&asc, body).map_err(|e| engine_io(&asc, e))?;
        std::fs::write(&prj, format!("EPSG:{}\n", grid.spatial_ref.wkid))
            .map_err(|e| engine_io(&prj, e))?;
        Ok(vec![asc, prj])
    }
}

/// Expand `env` outward to whole cells of `grid`.
fn snap(env: &Envelope, grid: &RasterSpec) -> (f64, f64, usize, usize) {
    let cs = grid.cell_size;
    let xmin = grid.origin.x + ((env.min_x - grid.origin.x) / cs).floor() * cs;
    let ymin = grid.origin.y + ((env.min_y - grid.origin.y) / cs).floor() * cs;
    let xmax = grid.origin.x + ((env.max_x - grid.origin.x) / cs).ceil() * cs;
    let ymax = grid.origin.y + ((env.max_y - grid.origin.y) / cs).ceil() * cs;
    let ncols = (((xmax - xmin) / cs).round() as usize).max(1);
    let nrows = (((ymax - ymin) / cs).round() as usize).max(1);
    (xmin, ymin, ncols, nrows)
}
