use itertools::izip;
use multiversion::multiversion;

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    let mut result = 0.;
    for (val1, val2) in a.iter().zip(b) {
        result += *val1 * *val2;
    }
    result
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    let n = x.len();
    assert!(y.len() == n);

    izip!(x, y).for_each(|(x, y)| {
        *y += a * x;
    });
}

/// `out = a * x + b * y`
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn weighted_sum(x: &[f64], a: f64, y: &[f64], b: f64, out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(x, y, out)| {
        *out = a * x + b * y;
    });
}

/// `out = x - y`
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn difference(x: &[f64], y: &[f64], out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(x, y, out)| {
        *out = x - y;
    });
}

/// Rank one update of a dense row-major `n × n` matrix: `mat += a * x xᵀ`.
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn rank_one_update(x: &[f64], mat: &mut [f64], a: f64) {
    let n = x.len();
    assert!(mat.len() == n * n);

    for (row, &xi) in mat.chunks_exact_mut(n).zip(x) {
        izip!(row, x).for_each(|(out, xj)| {
            *out += a * xi * xj;
        });
    }
}

/// `ln(2π)`
pub(crate) const LN_2PI: f64 = 1.8378770664093453;
