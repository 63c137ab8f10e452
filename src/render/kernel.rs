use rayon::prelude::*;

use crate::distributed::TaskSheet;

/// Escape-time iteration count for one point `c` of the complex plane:
/// iterate `z ← z² + c` from zero until `|z| > 2` or the cap is reached
#[inline]
pub fn escape_time(cx: f64, cy: f64, max_iterations: u16) -> u16 {
    let (mut x, mut y) = (0.0_f64, 0.0_f64);
    let (mut x2, mut y2) = (0.0_f64, 0.0_f64);
    let mut iteration = 0;
    while x2 + y2 <= 4.0 && iteration < max_iterations {
        y = 2.0 * x * y + cy;
        x = x2 - y2 + cx;
        x2 = x * x;
        y2 = y * y;
        iteration += 1;
    }
    iteration
}

fn compute_row(sheet: &TaskSheet, row: u32) -> Vec<u16> {
    (0..sheet.width())
        .map(|col| {
            let (cx, cy) = sheet.pixel_to_complex(col, row);
            escape_time(cx, cy, sheet.max_iterations())
        })
        .collect()
}

/// Computes a sheet's rows serially, top to bottom. Local pool workers use
/// this; their parallelism comes from the pool itself.
pub fn compute_rows(sheet: &TaskSheet) -> Vec<u16> {
    let mut iterations = Vec::with_capacity(sheet.pixel_count());
    for row in sheet.rows() {
        iterations.append(&mut compute_row(sheet, row));
    }
    iterations
}

/// Computes a sheet's rows in parallel. Remote worker nodes use this to
/// spread a single sheet over all of their cores.
pub fn compute_rows_parallel(sheet: &TaskSheet) -> Vec<u16> {
    sheet
        .rows()
        .into_par_iter()
        .flat_map_iter(|row| compute_row(sheet, row))
        .collect()
}
