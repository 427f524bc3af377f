//! Multi-anchor trilateration.
//!
//! Solves for a 3-D point given anchor positions and distance estimates by
//! linearizing the sphere equations against the first anchor and solving the
//! normal equations in least-squares sense. Distance estimates from the
//! path-loss model are noisy and usually inconsistent, so an exact
//! intersection rarely exists; least squares picks the nearest point.
//!
//! When every anchor sits at the same height the z column vanishes and the
//! system is solved in the x/y plane with z fixed to the mean anchor height.
//! Only the 2-D projection is consumed downstream.

use thiserror::Error;

/// Determinant threshold below which a system is treated as singular.
const SINGULAR_EPS: f64 = 1e-9;

/// Errors from the trilateration solver.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrilatError {
    /// Fewer than three `(anchor, distance)` pairs.
    #[error("need at least 3 anchors, got {0}")]
    NotEnoughAnchors(usize),

    /// Anchor and distance slices differ in length.
    #[error("{anchors} anchors but {distances} distances")]
    LengthMismatch {
        /// Anchor count
        anchors: usize,
        /// Distance count
        distances: usize,
    },

    /// Anchors are collinear or coincident; no unique solution exists.
    #[error("anchor geometry is degenerate")]
    Degenerate,
}

/// Solve for the point best matching the given anchor distances.
pub fn solve(anchors: &[[f64; 3]], distances: &[f64]) -> Result<[f64; 3], TrilatError> {
    if anchors.len() != distances.len() {
        return Err(TrilatError::LengthMismatch {
            anchors: anchors.len(),
            distances: distances.len(),
        });
    }
    if anchors.len() < 3 {
        return Err(TrilatError::NotEnoughAnchors(anchors.len()));
    }

    let a0 = anchors[0];
    let d0 = distances[0];
    let norm0 = dot(a0, a0);

    // Rows of the linearized system: 2(ai - a0) · p = |ai|² - |a0|² - (di² - d0²)
    let mut rows = Vec::with_capacity(anchors.len() - 1);
    let mut rhs = Vec::with_capacity(anchors.len() - 1);
    for (ai, &di) in anchors.iter().zip(distances).skip(1) {
        rows.push([2.0 * (ai[0] - a0[0]), 2.0 * (ai[1] - a0[1]), 2.0 * (ai[2] - a0[2])]);
        rhs.push(dot(*ai, *ai) - norm0 - (di * di - d0 * d0));
    }

    // Normal equations: (AᵀA) p = Aᵀb
    let mut m = [[0.0f64; 3]; 3];
    let mut v = [0.0f64; 3];
    for (row, &b) in rows.iter().zip(&rhs) {
        for i in 0..3 {
            v[i] += row[i] * b;
            for j in 0..3 {
                m[i][j] += row[i] * row[j];
            }
        }
    }

    if let Some(p) = solve3(m, v) {
        return Ok(p);
    }

    // Coplanar anchors at a shared height leave z unconstrained: solve the
    // x/y subsystem and pin z to the mean anchor height.
    let m2 = [[m[0][0], m[0][1]], [m[1][0], m[1][1]]];
    let v2 = [v[0], v[1]];
    let Some([x, y]) = solve2(m2, v2) else {
        return Err(TrilatError::Degenerate);
    };
    let mean_z = anchors.iter().map(|a| a[2]).sum::<f64>() / anchors.len() as f64;
    Ok([x, y, mean_z])
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Solve a 3×3 system by Cramer's rule; `None` when singular.
fn solve3(m: [[f64; 3]; 3], v: [f64; 3]) -> Option<[f64; 3]> {
    let det = det3(m);
    if det.abs() < SINGULAR_EPS {
        return None;
    }
    let mut out = [0.0f64; 3];
    for col in 0..3 {
        let mut replaced = m;
        for row in 0..3 {
            replaced[row][col] = v[row];
        }
        out[col] = det3(replaced) / det;
    }
    Some(out)
}

fn det3(m: [[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Solve a 2×2 system by Cramer's rule; `None` when singular.
fn solve2(m: [[f64; 2]; 2], v: [f64; 2]) -> Option<[f64; 2]> {
    let det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
    if det.abs() < SINGULAR_EPS {
        return None;
    }
    Some([
        (v[0] * m[1][1] - v[1] * m[0][1]) / det,
        (m[0][0] * v[1] - m[1][0] * v[0]) / det,
    ])
}
