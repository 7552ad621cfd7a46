//! Signed-distance shapes and their rasterization into sparse occupancy
//!
//! Shapes live in cell space: cell `c` covers `[c, c + 1)` on each axis and
//! is active when its center `c + 0.5` is inside a shape.

use serde::{Deserialize, Serialize};

use grid_kernel::{IndexBox, Occupancy, SparseGrid};

/// A solid described by its signed distance function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Shape {
    /// Ball around `center`.
    Sphere {
        /// Center in cell space.
        center: [f32; 3],
        /// Radius in cells.
        radius: f32,
    },
    /// Axis-aligned box.
    Box {
        /// Minimum corner.
        min: [f32; 3],
        /// Maximum corner.
        max: [f32; 3],
    },
    /// Union of shapes.
    Union {
        /// Members.
        shapes: Vec<Shape>,
    },
}

fn length(v: [f32; 3]) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

impl Shape {
    /// Signed distance from `p`, negative inside.
    pub fn sdf(&self, p: [f32; 3]) -> f32 {
        match self {
            Shape::Sphere { center, radius } => {
                length([p[0] - center[0], p[1] - center[1], p[2] - center[2]]) - radius
            }
            Shape::Box { min, max } => {
                let q: [f32; 3] = std::array::from_fn(|i| {
                    let c = 0.5 * (min[i] + max[i]);
                    let h = 0.5 * (max[i] - min[i]);
                    (p[i] - c).abs() - h
                });
                let outside = length(q.map(|v| v.max(0.0)));
                let inside = q[0].max(q[1]).max(q[2]).min(0.0);
                outside + inside
            }
            Shape::Union { shapes } => shapes
                .iter()
                .map(|s| s.sdf(p))
                .fold(f32::INFINITY, f32::min),
        }
    }

    /// Whether the center of `cell` is inside.
    pub fn contains_cell(&self, cell: [i32; 3]) -> bool {
        self.sdf(cell.map(|c| c as f32 + 0.5)) <= 0.0
    }

    /// Axis-aligned bounds, `None` for an empty union.
    pub fn bounds(&self) -> Option<([f32; 3], [f32; 3])> {
        match self {
            Shape::Sphere { center, radius } => Some((
                center.map(|c| c - radius),
                center.map(|c| c + radius),
            )),
            Shape::Box { min, max } => Some((*min, *max)),
            Shape::Union { shapes } => shapes.iter().filter_map(Shape::bounds).reduce(|a, b| {
                (
                    std::array::from_fn(|i| a.0[i].min(b.0[i])),
                    std::array::from_fn(|i| a.1[i].max(b.1[i])),
                )
            }),
        }
    }

    /// Cells whose centers could be inside.
    pub fn cell_bounds(&self) -> Option<IndexBox> {
        let (lo, hi) = self.bounds()?;
        let min = lo.map(|v| (v - 0.5).ceil() as i32);
        let max = hi.map(|v| (v - 0.5).floor() as i32);
        (0..3).all(|i| min[i] <= max[i]).then(|| IndexBox::new(min, max))
    }
}

/// Active cells of the union of `shapes`.
pub fn rasterize(shapes: &[Shape]) -> SparseGrid {
    let union = Shape::Union {
        shapes: shapes.to_vec(),
    };
    let mut builder = SparseGrid::builder();
    if let Some(region) = union.cell_bounds() {
        for cell in region.cells() {
            if union.contains_cell(cell) {
                builder.activate(cell);
            }
        }
    }
    let grid = builder.build();
    tracing::info!(
        "Rasterized {} shape(s): {} blocks, {} active cells",
        shapes.len(),
        grid.block_count(),
        grid.active_cell_count()
    );
    grid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_sdf_sign() {
        let b = Shape::Box {
            min: [0.0; 3],
            max: [4.0; 3],
        };
        assert!(b.sdf([2.0, 2.0, 2.0]) < 0.0);
        assert!((b.sdf([5.0, 2.0, 2.0]) - 1.0).abs() < 1e-6);
        assert!((b.sdf([2.0, 2.0, 2.0]) + 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_box_rasterizes_exactly() {
        let grid = rasterize(&[Shape::Box {
            min: [0.0; 3],
            max: [16.0, 8.0, 8.0],
        }]);
        assert_eq!(grid.block_count(), 2);
        assert_eq!(grid.active_cell_count(), 16 * 8 * 8);
        assert!(grid.is_active([15, 7, 7]));
        assert!(!grid.is_active([16, 0, 0]));
    }

    #[test]
    fn test_sphere_is_sparse() {
        let grid = rasterize(&[Shape::Sphere {
            center: [0.0; 3],
            radius: 10.0,
        }]);
        let n = grid.active_cell_count() as f64;
        let volume = 4.0 / 3.0 * std::f64::consts::PI * 1000.0;
        assert!((n - volume).abs() / volume < 0.05, "{n} cells vs {volume}");
        assert!(grid.is_active([0, 0, 0]));
        assert!(!grid.is_active([9, 9, 9]));
    }

    #[test]
    fn test_union_and_empty() {
        let a = Shape::Box {
            min: [0.0; 3],
            max: [8.0; 3],
        };
        let b = Shape::Box {
            min: [16.0, 0.0, 0.0],
            max: [24.0, 8.0, 8.0],
        };
        let grid = rasterize(&[a, b]);
        assert_eq!(grid.block_count(), 2);
        assert_eq!(rasterize(&[]).block_count(), 0);
    }

    #[test]
    fn test_shape_json_tag() {
        let s: Shape =
            serde_json::from_str(r#"{ "type": "Sphere", "center": [1, 2, 3], "radius": 4 }"#)
                .unwrap();
        assert_eq!(
            s,
            Shape::Sphere {
                center: [1.0, 2.0, 3.0],
                radius: 4.0
            }
        );
    }
}
