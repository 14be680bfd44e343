//! Fixed-grid ASCII plots of per-point channel results.
//!
//! Output is deterministic for a given width and height, so tests compare
//! whole renderings. Drawing order is curve, then bars, then markers, so a
//! mean always stays visible:
//! - `-` accepted fit evaluated across the x range
//! - `|` mean ± SEM
//! - `o` mean

use crate::domain::{ChannelResults, FitResult};
use crate::fit::FitFunction;

#[derive(Debug, Clone, Copy)]
struct Marker {
    x: f64,
    mean: f64,
    sem: f64,
}

/// Render means ± SEM of one channel, with its top-level fit when accepted.
pub fn render_channel_plot(results: &ChannelResults, width: usize, height: usize) -> String {
    let width = width.max(10);
    let height = height.max(5);

    let markers: Vec<Marker> = results
        .means
        .iter()
        .enumerate()
        .filter_map(|(i, mean)| {
            let x = results.xs.get(i).copied().flatten()?;
            let mean = (*mean)?;
            let sem = results.sems.get(i).copied().flatten().unwrap_or(0.0);
            Some(Marker { x, mean, sem })
        })
        .collect();

    let (x_min, x_max) = x_range(&markers).unwrap_or((0.0, 1.0));
    let curve = results
        .fit
        .as_ref()
        .filter(|f| f.accepted)
        .map(|f| sample_curve(f, x_min, x_max, width));

    let (y_min, y_max) = y_range(&markers, curve.as_deref()).unwrap_or((0.0, 1.0));
    let (y_min, y_max) = pad_range(y_min, y_max, 0.05);

    let mut grid = vec![vec![' '; width]; height];

    // Curve first so bars and points overlay it.
    if let Some(curve) = &curve {
        draw_curve(&mut grid, curve, x_min, x_max, y_min, y_max);
    }
    for m in &markers {
        let x = map_x(m.x, x_min, x_max, width);
        let top = map_y(m.mean + m.sem, y_min, y_max, height);
        let bottom = map_y(m.mean - m.sem, y_min, y_max, height);
        for row in grid.iter_mut().take(bottom + 1).skip(top) {
            row[x] = '|';
        }
    }
    for m in &markers {
        let x = map_x(m.x, x_min, x_max, width);
        let y = map_y(m.mean, y_min, y_max, height);
        grid[y][x] = 'o';
    }

    let mut out = String::new();
    out.push_str(&format!(
        "Plot {}: x=[{x_min:.3}, {x_max:.3}] | y=[{y_min:.2}, {y_max:.2}]\n",
        results.channel
    ));
    for row in grid {
        out.push_str(&row.into_iter().collect::<String>());
        out.push('\n');
    }
    out
}

fn x_range(markers: &[Marker]) -> Option<(f64, f64)> {
    let mut min_x = f64::INFINITY;
    let mut max_x = f64::NEG_INFINITY;
    for m in markers {
        min_x = min_x.min(m.x);
        max_x = max_x.max(m.x);
    }
    if !(min_x.is_finite() && max_x.is_finite()) {
        return None;
    }
    if max_x > min_x {
        Some((min_x, max_x))
    } else {
        Some((min_x - 0.5, max_x + 0.5))
    }
}

fn sample_curve(fit: &FitResult, x_min: f64, x_max: f64, n: usize) -> Vec<(f64, f64)> {
    let n = n.max(2);
    (0..n)
        .filter_map(|i| {
            let u = i as f64 / (n as f64 - 1.0);
            let x = x_min + u * (x_max - x_min);
            FitFunction::eval_fit(fit, x)
                .filter(|y| y.is_finite())
                .map(|y| (x, y))
        })
        .collect()
}

fn y_range(markers: &[Marker], curve: Option<&[(f64, f64)]>) -> Option<(f64, f64)> {
    let mut min_y = f64::INFINITY;
    let mut max_y = f64::NEG_INFINITY;

    for m in markers {
        min_y = min_y.min(m.mean - m.sem);
        max_y = max_y.max(m.mean + m.sem);
    }
    if let Some(curve) = curve {
        for &(_, y) in curve {
            min_y = min_y.min(y);
            max_y = max_y.max(y);
        }
    }

    if min_y.is_finite() && max_y.is_finite() && max_y > min_y {
        Some((min_y, max_y))
    } else if min_y.is_finite() && max_y.is_finite() {
        Some((min_y - 0.5, max_y + 0.5))
    } else {
        None
    }
}

fn pad_range(min: f64, max: f64, frac: f64) -> (f64, f64) {
    let span = (max - min).abs();
    let pad = (span * frac).max(1e-12);
    (min - pad, max + pad)
}

fn map_x(x: f64, x_min: f64, x_max: f64, width: usize) -> usize {
    let width = width.max(2);
    let u = ((x - x_min) / (x_max - x_min)).clamp(0.0, 1.0);
    (u * (width as f64 - 1.0)).round() as usize
}

fn map_y(y: f64, y_min: f64, y_max: f64, height: usize) -> usize {
    let height = height.max(2);
    let u = ((y - y_min) / (y_max - y_min)).clamp(0.0, 1.0);
    // Row 0 is the top (y_max).
    (height as f64 - 1.0 - (u * (height as f64 - 1.0))).round() as usize
}

fn draw_curve(grid: &mut [Vec<char>], curve: &[(f64, f64)], x_min: f64, x_max: f64, y_min: f64, y_max: f64) {
    if curve.len() < 2 {
        return;
    }
    let height = grid.len();
    let width = grid[0].len();

    let mut prev = None;
    for &(x, y) in curve {
        let col = map_x(x, x_min, x_max, width);
        let row = map_y(y, y_min, y_max, height);
        if let Some((c0, r0)) = prev {
            draw_line(grid, c0, r0, col, row, '-');
        } else {
            grid[row][col] = '-';
        }
        prev = Some((col, row));
    }
}

/// Integer line drawing (Bresenham).
fn draw_line(grid: &mut [Vec<char>], x0: usize, y0: usize, x1: usize, y1: usize, ch: char) {
    let mut x0 = x0 as isize;
    let mut y0 = y0 as isize;
    let x1 = x1 as isize;
    let y1 = y1 as isize;

    let dx = (x1 - x0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let dy = -(y1 - y0).abs();
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        if y0 >= 0
            && (y0 as usize) < grid.len()
            && x0 >= 0
            && (x0 as usize) < grid[0].len()
            && grid[y0 as usize][x0 as usize] == ' '
        {
            grid[y0 as usize][x0 as usize] = ch;
        }

        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}
