use std::collections::HashMap;

const SQRT3: f64 = 1.732_050_807_568_877_2;

// Axial coordinates of a pointy-top hexagon.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hex {
    q: i32,
    r: i32,
}

impl Hex {
    fn new(q: i32, r: i32) -> Hex {
        Hex { q, r }
    }
}

#[derive(Clone, Copy, Debug)]
struct HexLayout {
    origin: (f64, f64),
    size: f64,
}

impl HexLayout {
    fn hex_to_world_pos(&self, hex: Hex) -> (f64, f64) {
        let q = hex.q as f64;
        let r = hex.r as f64;
        (
            self.origin.0 + self.size * (SQRT3 * q + SQRT3 / 2.0 * r),
            self.origin.1 + self.size * 1.5 * r,
        )
    }

    fn world_pos_to_hex(&self, pos: (f64, f64)) -> Hex {
        let px = (pos.0 - self.origin.0) / self.size;
        let py = (pos.1 - self.origin.1) / self.size;
        let q = SQRT3 / 3.0 * px - py / 3.0;
        let r = 2.0 / 3.0 * py;
        cube_round(q, r)
    }
}

// Round fractional axial coordinates to the containing hexagon.
fn cube_round(qf: f64, rf: f64) -> Hex {
    let sf = -qf - rf;
    let mut q = qf.round();
    let mut r = rf.round();
    let s = sf.round();

    let dq = (q - qf).abs();
    let dr = (r - rf).abs();
    let ds = (s - sf).abs();

    if dq > dr && dq > ds {
        q = -r - s;
    } else if dr > ds {
        r = -q - s;
    }

    Hex::new(q as i32, r as i32)
}

#[derive(Clone, Debug, PartialEq)]
pub struct HexCell {
    pub center_x: f64,
    pub center_y: f64,
    pub value: f64,
}

/// Accumulates a per-hexagon sum over `n_move × n_move` hexagonal grids, each
/// shifted by a fraction of the hexagon width (x) and row spacing (y). Every
/// point contributes once to every shifted grid, which gives a finer density
/// estimate than a single tiling.
pub struct HexGridAggregator {
    layouts: Vec<HexLayout>,
    sums: HashMap<(usize, Hex), f64>,
}

impl HexGridAggregator {
    pub fn new(radius: f64, n_move: usize) -> HexGridAggregator {
        let n_move = n_move.max(1);
        let width = SQRT3 * radius;
        let row_spacing = 1.5 * radius;

        let mut layouts = Vec::with_capacity(n_move * n_move);
        for i in 0..n_move {
            for j in 0..n_move {
                layouts.push(HexLayout {
                    origin: (
                        i as f64 / n_move as f64 * width,
                        j as f64 / n_move as f64 * row_spacing,
                    ),
                    size: radius,
                });
            }
        }

        HexGridAggregator {
            layouts,
            sums: HashMap::new(),
        }
    }

    pub fn ngrids(&self) -> usize {
        self.layouts.len()
    }

    pub fn len(&self) -> usize {
        self.sums.len()
    }

    pub fn add(&mut self, x: f64, y: f64, value: f64) {
        for (k, layout) in self.layouts.iter().enumerate() {
            let hex = layout.world_pos_to_hex((x, y));
            *self.sums.entry((k, hex)).or_insert(0.0) += value;
        }
    }

    // Cells ordered by (grid, hex) so the order is reproducible across runs.
    pub fn into_cells(self) -> Vec<HexCell> {
        let layouts = self.layouts;
        let mut sums: Vec<((usize, Hex), f64)> = self.sums.into_iter().collect();
        sums.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        sums.into_iter()
            .map(|((k, hex), value)| {
                let (center_x, center_y) = layouts[k].hex_to_world_pos(hex);
                HexCell {
                    center_x,
                    center_y,
                    value,
                }
            })
            .collect()
    }
}

pub fn hex_area(radius: f64) -> f64 {
    radius * radius * 3.0 * SQRT3 / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    // Centers of the cells a point falls into, one per shifted grid.
    fn cell_centers(grid: &HexGridAggregator, x: f64, y: f64) -> Vec<(f64, f64)> {
        grid.layouts
            .iter()
            .map(|layout| layout.hex_to_world_pos(layout.world_pos_to_hex((x, y))))
            .collect()
    }

    #[test]
    fn test_every_point_is_covered() {
        let mut rng = StdRng::seed_from_u64(7);
        for &radius in &[0.5, 3.0, 15.0, 42.0] {
            for n_move in 1..4 {
                let grid = HexGridAggregator::new(radius, n_move);
                assert_eq!(grid.ngrids(), n_move * n_move);
                for _ in 0..500 {
                    let x = rng.random_range(-1000.0..1000.0);
                    let y = rng.random_range(-1000.0..1000.0);
                    let centers = cell_centers(&grid, x, y);
                    assert_eq!(centers.len(), n_move * n_move);
                    for (cx, cy) in centers {
                        let d = ((x - cx).powi(2) + (y - cy).powi(2)).sqrt();
                        assert!(d <= radius * (1.0 + 1e-9), "{} > {}", d, radius);
                    }
                }
            }
        }
    }

    #[test]
    fn test_sums_are_replicated_per_grid() {
        let mut grid = HexGridAggregator::new(15.0, 2);
        grid.add(1.0, 1.0, 2.0);
        grid.add(1.5, 0.5, 3.0);
        grid.add(200.0, 200.0, 1.0);
        let cells = grid.into_cells();
        let total: f64 = cells.iter().map(|c| c.value).sum();
        assert_eq!(total, 4.0 * 6.0);
        // the far point gets its own cell in each of the 4 grids
        assert!(cells.len() >= 8 && cells.len() <= 12);
    }

    #[test]
    fn test_hex_area() {
        approx::assert_relative_eq!(hex_area(1.0), 2.598076211353316, epsilon = 1e-12);
    }
}
